//! WebSocket transport.
//!
//! ```text
//! client                                relay
//!   ── REGISTER_CLIENT{metadata} ───────►  attach (CONNECTING)
//!   ◄─ CLIENT_REGISTERED{channelId} ─────  mark OPEN
//!   ── OBR_ACTION_REQUEST{requestId=c1,    dispatch under relay id r1
//!        targetChannelId?} ─────────────►     ──OBR_REQUEST{r1}──► target
//!                                             ◄─OBR_RESPONSE{r1}── target
//!   ◄─ OBR_RESPONSE{requestId=c1} ───────  reply under the caller's id
//!   ◄─ ping (every keep-alive) / pong ──►
//! ```
//!
//! Nothing but `REGISTER_CLIENT` and `ping` is honoured before
//! registration. Every keep-alive tick sends both a WebSocket ping and a
//! JSON `ping`. A connection that sends no frame at all, pongs included,
//! for a whole keep-alive interval is closed and its channel unregistered.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::error::RelayError;
use crate::gateway::server::GatewayState;
use crate::observability::ObserverEvent;
use crate::protocol::{ActionResponse, Envelope, Invocation, Metadata, TransportKind};
use crate::relay::{AttachOptions, ChannelLease, TransportHandle};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let _connection = state.ws_tracker.track();
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<()>();

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                envelope = out_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    match envelope.to_json() {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            tracing::error!(kind = envelope.kind(), "Failed to serialize frame: {}", e);
                            continue;
                        }
                    }
                }
                Some(()) = ping_rx.recv() => Message::Ping(Bytes::new()),
            };
            if sink.send(frame).await.is_err() {
                tracing::debug!("WebSocket send failed, closing");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = WsSession {
        state: Arc::clone(&state),
        out: out_tx,
        lease: None,
    };

    let mut ticker = interval_at(Instant::now() + state.keepalive, state.keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heard_since_tick = false;

    loop {
        tokio::select! {
            frame = stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket receive error: {e}");
                        break;
                    }
                    None => break,
                };
                heard_since_tick = true;
                match msg {
                    Message::Text(text) => session.handle_text(text.as_str()),
                    Message::Close(_) => {
                        tracing::debug!("Client closed WebSocket");
                        break;
                    }
                    // Protocol-level ping/pong and binary frames only count as liveness.
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if !heard_since_tick {
                    tracing::info!(
                        channel = ?session.lease.as_ref().map(|l| l.id().to_string()),
                        "No traffic for a keep-alive interval, closing WebSocket"
                    );
                    break;
                }
                heard_since_tick = false;
                // Clients answer the protocol ping on their own; the JSON one is for tabs.
                let _ = ping_tx.send(());
                let _ = session.out.send(Envelope::Ping);
            }
        }
    }

    // Unregisters the channel and fails calls still waiting on it.
    drop(session);
    send_task.abort();
}

/// Per-connection protocol state.
struct WsSession {
    state: Arc<GatewayState>,
    out: TransportHandle,
    lease: Option<ChannelLease>,
}

impl WsSession {
    fn handle_text(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed WebSocket frame");
                self.state
                    .relay
                    .observer()
                    .record_event(&ObserverEvent::TransportError {
                        transport: TransportKind::WebSocket.to_string(),
                        message: e.to_string(),
                    });
                return;
            }
        };

        match envelope {
            Envelope::Ping => self.reply(Envelope::Pong),
            Envelope::Pong => {}
            Envelope::RegisterClient { metadata } => self.register(metadata),
            Envelope::Request(invocation) => self.forward(invocation),
            Envelope::Response(response) => match &self.lease {
                Some(lease) => {
                    self.state.relay.on_response(Some(lease.id()), response);
                }
                None => tracing::debug!("Dropping response from unregistered client"),
            },
            Envelope::UpdateMetadata { metadata } => match &self.lease {
                Some(lease) => {
                    let _ = self.state.relay.registry().update_metadata(lease.id(), metadata);
                }
                None => tracing::debug!("Dropping metadata update from unregistered client"),
            },
            Envelope::ListClients { request_id } => {
                if self.lease.is_none() {
                    tracing::debug!("Dropping LIST_CLIENTS from unregistered client");
                    return;
                }
                let clients = self.state.relay.registry().list();
                self.reply(Envelope::ClientsList {
                    clients,
                    request_id,
                });
            }
            other @ (Envelope::ClientRegistered { .. } | Envelope::ClientsList { .. }) => {
                tracing::debug!(kind = other.kind(), "Ignoring server-only frame from client");
            }
        }
    }

    fn reply(&self, envelope: Envelope) {
        let _ = self.out.send(envelope);
    }

    fn register(&mut self, metadata: Metadata) {
        if let Some(lease) = &self.lease {
            // Re-registration refreshes metadata and repeats the ack.
            let _ = self
                .state
                .relay
                .registry()
                .update_metadata(lease.id(), metadata);
            self.reply(Envelope::ClientRegistered {
                channel_id: lease.id().clone(),
                success: true,
            });
            return;
        }

        let options = AttachOptions::new(TransportKind::WebSocket)
            .with_metadata(metadata)
            .with_handshake();
        match self.state.relay.attach(self.out.clone(), options) {
            Ok(lease) => self.lease = Some(lease),
            Err(e) => tracing::warn!(error = %e, "WebSocket registration failed"),
        }
    }

    /// Relay a request from this client and answer it under the client's id.
    fn forward(&self, invocation: Invocation) {
        let Some(lease) = &self.lease else {
            self.reply(Envelope::Response(ActionResponse::failure(
                invocation.request_id,
                "Client not registered",
            )));
            return;
        };

        let relay = Arc::clone(lease.relay());
        let from = lease.id().clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            let Invocation {
                action,
                args,
                request_id,
                target_channel_id,
                timeout,
                ..
            } = invocation;
            let outcome = relay
                .dispatch(
                    Some(&from),
                    target_channel_id.as_ref(),
                    &action,
                    args,
                    timeout.map(Duration::from_millis),
                )
                .await;

            let response = match outcome {
                Ok(data) => ActionResponse::success(request_id, data),
                Err(RelayError::ActionNotFound { action, available }) => {
                    ActionResponse::not_found(request_id, &action, available)
                }
                Err(e) => ActionResponse::failure(request_id, e.to_string()),
            };
            // The requester may have disconnected meanwhile.
            let _ = out.send(Envelope::Response(response));
        });
    }
}
