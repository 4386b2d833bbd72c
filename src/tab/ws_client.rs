//! Tab client for the WebSocket transport.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::ClientError;
use crate::executor::{ActionDispatcher, ActionExecutor};
use crate::protocol::{ChannelId, Envelope, Metadata};
use crate::tab::TabHandle;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsTabClient<E: ActionExecutor> {
    base_url: String,
    metadata: Metadata,
    dispatcher: ActionDispatcher<E>,
}

impl<E: ActionExecutor> WsTabClient<E> {
    pub fn new(base_url: impl Into<String>, dispatcher: ActionDispatcher<E>) -> Self {
        Self {
            base_url: base_url.into(),
            metadata: Metadata::new(),
            dispatcher,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Connect, register, and serve requests in the background.
    pub async fn connect(self) -> Result<TabHandle, ClientError> {
        let url = ws_url(&self.base_url);
        let (mut socket, _) =
            connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::ConnectionFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

        send(
            &mut socket,
            &Envelope::RegisterClient {
                metadata: self.metadata.clone(),
            },
        )
        .await?;

        let channel_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, await_registration(&mut socket))
            .await
            .map_err(|_| ClientError::RegistrationFailed {
                reason: format!("no CLIENT_REGISTERED within {:?}", HANDSHAKE_TIMEOUT),
            })??;

        tracing::info!(channel = %channel_id, "WebSocket channel registered");
        let task = tokio::spawn(self.run(socket, channel_id.clone()));
        Ok(TabHandle::new(channel_id, task))
    }

    async fn run(self, socket: Socket, channel_id: ChannelId) -> Result<(), ClientError> {
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Err(ClientError::ConnectionFailed {
                                url: self.base_url.clone(),
                                reason: e.to_string(),
                            });
                        }
                    };
                    match Envelope::parse(text.as_str()) {
                        Ok(Envelope::Ping) => {
                            let _ = out_tx.send(Envelope::Pong);
                        }
                        Ok(Envelope::Request(invocation)) => {
                            let dispatcher = self.dispatcher.clone();
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                let response = dispatcher.dispatch(invocation).await;
                                let _ = out.send(Envelope::Response(response));
                            });
                        }
                        Ok(other) => {
                            tracing::debug!(channel = %channel_id, kind = other.kind(), "Ignoring frame");
                        }
                        Err(e) => {
                            tracing::warn!(channel = %channel_id, error = %e, "Dropping malformed frame");
                        }
                    }
                }
                Some(envelope) = out_rx.recv() => {
                    let text = envelope.to_json().map_err(|e| ClientError::InvalidResponse {
                        reason: e.to_string(),
                    })?;
                    sink.send(Message::text(text))
                        .await
                        .map_err(|e| ClientError::ConnectionFailed {
                            url: self.base_url.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
        }

        tracing::info!(channel = %channel_id, "Relay closed the WebSocket");
        Ok(())
    }
}

async fn send(socket: &mut Socket, envelope: &Envelope) -> Result<(), ClientError> {
    let text = envelope
        .to_json()
        .map_err(|e| ClientError::InvalidResponse {
            reason: e.to_string(),
        })?;
    socket
        .send(Message::text(text))
        .await
        .map_err(|e| ClientError::RegistrationFailed {
            reason: e.to_string(),
        })
}

async fn await_registration(socket: &mut Socket) -> Result<ChannelId, ClientError> {
    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|e| ClientError::RegistrationFailed {
            reason: e.to_string(),
        })?;
        let Message::Text(text) = frame else {
            continue;
        };
        match Envelope::parse(text.as_str()) {
            Ok(Envelope::ClientRegistered {
                channel_id,
                success: true,
            }) => return Ok(channel_id),
            Ok(Envelope::ClientRegistered { success: false, .. }) => {
                return Err(ClientError::RegistrationFailed {
                    reason: "relay refused registration".to_string(),
                });
            }
            Ok(Envelope::Ping) => send(socket, &Envelope::Pong).await?,
            _ => {}
        }
    }
    Err(ClientError::RegistrationFailed {
        reason: "connection closed during handshake".to_string(),
    })
}

/// `http://host:port` → `ws://host:port/ws`.
pub fn ws_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    if base.ends_with("/ws") {
        base
    } else {
        format!("{}/ws", base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_from_http_base() {
        assert_eq!(ws_url("http://localhost:3000"), "ws://localhost:3000/ws");
        assert_eq!(ws_url("https://relay.example/"), "wss://relay.example/ws");
        assert_eq!(ws_url("ws://127.0.0.1:9/ws"), "ws://127.0.0.1:9/ws");
    }

    #[tokio::test]
    async fn https_base_attempts_tls_handshake() {
        // Accepts and hangs up, so the handshake fails after TLS starts.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let dispatcher =
            ActionDispatcher::new(std::sync::Arc::new(crate::executor::TabletopExecutor::new("Ann")));
        let err = WsTabClient::new(format!("https://127.0.0.1:{port}"), dispatcher)
            .connect()
            .await
            .err()
            .expect("handshake against a plain socket should fail");

        match err {
            ClientError::ConnectionFailed { url, reason } => {
                assert!(url.starts_with("wss://"));
                assert!(!reason.contains("TLS support not compiled in"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
