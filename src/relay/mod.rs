//! Request dispatcher tying the channel registry to the correlation table.
//!
//! ```text
//! caller ──invoke(target, action, args)──► Relay
//!                                            │ 1. target routable? else ChannelNotFound
//!                                            │ 2. CorrelationTable::begin (timer armed)
//!                                            │ 3. ChannelRegistry::send(OBR_REQUEST)
//!                                            ▼
//!                                     channel transport ──► tab executes
//!                                            │
//! caller ◄──────── PendingCall settles ◄── on_response(OBR_RESPONSE)
//! ```
//!
//! A `Relay` is built once by the hosting process and shared as
//! `Arc<Relay>`; tests build a fresh one each.
//!
//! There is no cancel signal for calls already pushed to a channel: once a
//! caller times out, the tab may still run the action to completion and its
//! late response is dropped.

pub mod correlation;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ChannelError, RelayError};
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::protocol::{
    ActionResponse, Args, ChannelId, ChannelState, Envelope, Invocation, Metadata, TransportKind,
};

pub use self::correlation::{CallOutcome, CorrelationTable, PendingCall};
pub use self::registry::{ChannelRegistry, TransportHandle};

/// Timeout policy for relayed calls.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Used when the caller does not pass a timeout.
    pub default_timeout: Duration,
    /// Caller-supplied timeouts are clamped to this.
    pub max_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_timeout: Duration::from_millis(MAX_TIMEOUT_MS),
        }
    }
}

/// Default per-call timeout for relayed calls.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Upper bound for caller-supplied timeouts.
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// How a channel joins the relay.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub transport: TransportKind,
    /// Id proposed by the channel; `None` lets the relay mint one.
    pub requested_id: Option<ChannelId>,
    pub metadata: Metadata,
    /// Push a `CLIENT_REGISTERED` ack before the channel becomes routable.
    pub handshake: bool,
}

impl AttachOptions {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            requested_id: None,
            metadata: Metadata::new(),
            handshake: false,
        }
    }

    pub fn with_id(mut self, id: ChannelId) -> Self {
        self.requested_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_handshake(mut self) -> Self {
        self.handshake = true;
        self
    }
}

/// The relay process state: channels plus in-flight calls.
pub struct Relay {
    registry: ChannelRegistry,
    correlation: Arc<CorrelationTable>,
    observer: Arc<dyn Observer>,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(settings: RelaySettings, observer: Arc<dyn Observer>) -> Arc<Self> {
        Arc::new(Self {
            registry: ChannelRegistry::new(),
            correlation: CorrelationTable::new(Arc::clone(&observer)),
            observer,
            settings,
        })
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    pub fn settings(&self) -> RelaySettings {
        self.settings
    }

    pub fn pending_count(&self) -> usize {
        self.correlation.len()
    }

    /// Register a channel whose pushes go to `handle`.
    ///
    /// The returned lease unregisters the channel when dropped, so the
    /// transport task that owns it ties registry lifetime to connection
    /// lifetime.
    pub fn attach(
        self: &Arc<Self>,
        handle: TransportHandle,
        options: AttachOptions,
    ) -> Result<ChannelLease, ChannelError> {
        let initial_state = if options.handshake {
            ChannelState::Connecting
        } else {
            ChannelState::Open
        };

        let id = match options.requested_id {
            Some(id) => {
                self.registry.register_as(
                    id.clone(),
                    handle.clone(),
                    options.transport,
                    initial_state,
                )?;
                id
            }
            None if options.handshake => {
                self.registry.register_connecting(handle.clone(), options.transport)
            }
            None => self.registry.register(handle.clone(), options.transport),
        };
        let lease = ChannelLease {
            relay: Arc::clone(self),
            id: id.clone(),
        };

        if !options.metadata.is_empty() {
            self.registry.update_metadata(&id, options.metadata)?;
        }

        if options.handshake {
            let ack = Envelope::ClientRegistered {
                channel_id: id.clone(),
                success: true,
            };
            // A failed ack drops the lease: CONNECTING -> CLOSED.
            handle
                .send(ack)
                .map_err(|_| ChannelError::Closed { id: id.clone() })?;
            self.registry.mark_open(&id)?;
        }

        tracing::info!(channel = %id, transport = %options.transport, "Channel registered");
        self.observer.record_event(&ObserverEvent::ChannelOpened {
            channel: id.to_string(),
            transport: options.transport.to_string(),
        });
        self.observer
            .record_metric(&ObserverMetric::ActiveChannels(self.registry.len() as u64));
        Ok(lease)
    }

    /// Unregister a channel and fail every call still waiting on it.
    ///
    /// Returns `false` if the channel was already gone.
    pub fn disconnect(&self, id: &ChannelId) -> bool {
        if self.registry.unregister(id).is_none() {
            return false;
        }
        let rejected = self.correlation.fail_channel(id);
        tracing::info!(channel = %id, rejected, "Channel closed");
        self.observer.record_event(&ObserverEvent::ChannelClosed {
            channel: id.to_string(),
            rejected,
        });
        self.observer
            .record_metric(&ObserverMetric::ActiveChannels(self.registry.len() as u64));
        true
    }

    /// Invoke `action` on channel `target` and wait for the outcome.
    pub async fn invoke(
        &self,
        target: &ChannelId,
        action: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        self.dispatch(None, Some(target), action, args, timeout).await
    }

    /// Invoke on behalf of channel `from`.
    ///
    /// A missing `target` means `from` itself. Unknown targets fail
    /// immediately rather than waiting out the timeout.
    pub async fn dispatch(
        &self,
        from: Option<&ChannelId>,
        target: Option<&ChannelId>,
        action: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        let Some(target) = target.or(from) else {
            return Err(RelayError::ChannelNotFound {
                channel: ChannelId::from(""),
            });
        };
        if !self.registry.is_routable(target) {
            return Err(RelayError::ChannelNotFound {
                channel: target.clone(),
            });
        }

        let timeout = self.effective_timeout(timeout);
        let call = self.correlation.begin(target.clone(), action, timeout);
        let envelope = Envelope::Request(Invocation {
            action: action.to_string(),
            args,
            request_id: call.request_id().clone(),
            target_channel_id: None,
            from_channel_id: from.cloned(),
            timeout: Some(timeout.as_millis() as u64),
        });

        match self.registry.send(target, envelope) {
            Ok(()) => {
                tracing::debug!(channel = %target, action, request_id = %call.request_id(), "Invocation sent");
                self.observer.record_event(&ObserverEvent::InvocationSent {
                    channel: target.to_string(),
                    action: action.to_string(),
                });
            }
            Err(e) => {
                // Closed between lookup and send.
                tracing::warn!(channel = %target, action, error = %e, "Failed to push invocation");
                self.correlation.reject(
                    call.request_id(),
                    RelayError::ChannelClosed {
                        channel: target.clone(),
                    },
                );
            }
        }

        call.wait().await
    }

    /// Feed a response from a channel into the correlation table.
    ///
    /// Responses for unknown or already-settled requests are dropped.
    pub fn on_response(&self, from: Option<&ChannelId>, response: ActionResponse) -> bool {
        self.correlation.resolve(response, from)
    }

    /// Clamp a caller-supplied timeout; zero or absent means the default.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.settings.max_timeout),
            _ => self.settings.default_timeout,
        }
    }
}

/// Registration held by a live transport connection.
///
/// Dropping it unregisters the channel exactly once.
pub struct ChannelLease {
    relay: Arc<Relay>,
    id: ChannelId,
}

impl ChannelLease {
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.relay.disconnect(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::observability::NoopObserver;

    fn relay() -> Arc<Relay> {
        Relay::new(RelaySettings::default(), Arc::new(NoopObserver))
    }

    /// Attach a channel that answers every request through `reply`.
    fn spawn_channel<F>(relay: &Arc<Relay>, delay: Duration, reply: F) -> ChannelId
    where
        F: Fn(Invocation) -> Option<ActionResponse> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lease = relay
            .attach(tx, AttachOptions::new(TransportKind::Sse))
            .unwrap();
        let id = lease.id().clone();
        tokio::spawn(async move {
            let lease = lease;
            while let Some(envelope) = rx.recv().await {
                if let Envelope::Request(inv) = envelope {
                    tokio::time::sleep(delay).await;
                    if let Some(resp) = reply(inv) {
                        lease.relay().on_response(Some(lease.id()), resp);
                    }
                }
            }
        });
        id
    }

    #[tokio::test(start_paused = true)]
    async fn echo_round_trip() {
        let relay = relay();
        let t1 = spawn_channel(&relay, Duration::from_millis(100), |inv| {
            Some(ActionResponse::success(
                inv.request_id,
                inv.args.0.first().cloned().unwrap_or_default(),
            ))
        });

        let result = relay
            .invoke(&t1, "echo", Args::from(json!(["hi"])), Some(Duration::from_secs(5)))
            .await;
        assert_eq!(result.unwrap(), json!("hi"));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_action_rejects_with_not_found() {
        let relay = relay();
        let t1 = spawn_channel(&relay, Duration::ZERO, |inv| {
            Some(ActionResponse::not_found(inv.request_id, &inv.action, vec!["echo".into()]))
        });

        let err = relay
            .invoke(&t1, "doesNotExist", Args::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Action 'doesNotExist' not found");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_times_out() {
        let relay = relay();
        let t1 = spawn_channel(&relay, Duration::ZERO, |_| None);

        let start = Instant::now();
        let err = relay
            .invoke(&t1, "echo", Args::default(), Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(250));
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_channel_fails_fast() {
        let relay = relay();
        let start = Instant::now();
        let err = relay
            .invoke(&ChannelId::from("nope"), "echo", Args::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelNotFound { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_rejects_pending_with_channel_closed() {
        let relay = relay();
        let (tx, _rx) = mpsc::unbounded_channel();
        let lease = relay
            .attach(tx, AttachOptions::new(TransportKind::WebSocket))
            .unwrap();
        let t1 = lease.id().clone();

        let caller = {
            let relay = Arc::clone(&relay);
            let t1 = t1.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let outcome = relay
                    .invoke(&t1, "echo", Args::default(), Some(Duration::from_secs(5)))
                    .await;
                (outcome, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.pending_count(), 1);
        drop(lease);

        let (outcome, elapsed) = caller.await.unwrap();
        assert!(matches!(outcome, Err(RelayError::ChannelClosed { .. })));
        assert!(elapsed < Duration::from_millis(100));
        assert!(relay.registry().get(&t1).is_none());
        assert!(!relay.disconnect(&t1));
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_dead_transport_is_channel_closed() {
        let relay = relay();
        let (tx, rx) = mpsc::unbounded_channel();
        let lease = relay
            .attach(tx, AttachOptions::new(TransportKind::Sse))
            .unwrap();
        drop(rx);

        let err = relay
            .invoke(lease.id(), "echo", Args::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelClosed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn self_target_uses_sender_channel() {
        let relay = relay();
        let t1 = spawn_channel(&relay, Duration::ZERO, |inv| {
            Some(ActionResponse::success(
                inv.request_id,
                json!({"from": inv.from_channel_id}),
            ))
        });

        let result = relay
            .dispatch(Some(&t1), None, "whoami", Args::default(), None)
            .await
            .unwrap();
        assert_eq!(result, json!({"from": t1.as_str()}));
    }

    #[tokio::test]
    async fn handshake_acks_before_open() {
        let relay = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metadata = json!({"playerName": "Ann"}).as_object().cloned().unwrap();
        let lease = relay
            .attach(
                tx,
                AttachOptions::new(TransportKind::WebSocket)
                    .with_metadata(metadata)
                    .with_handshake(),
            )
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Envelope::ClientRegistered {
                channel_id: lease.id().clone(),
                success: true
            }
        );
        let summary = relay.registry().get(lease.id()).unwrap();
        assert_eq!(summary.state, ChannelState::Open);
        assert_eq!(summary.metadata["playerName"], "Ann");
    }

    #[tokio::test]
    async fn requested_id_conflict_is_rejected() {
        let relay = relay();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id = ChannelId::from("tab_fixed");
        let _lease = relay
            .attach(tx1, AttachOptions::new(TransportKind::Sse).with_id(id.clone()))
            .unwrap();
        assert!(matches!(
            relay.attach(tx2, AttachOptions::new(TransportKind::Sse).with_id(id)),
            Err(ChannelError::IdTaken { .. })
        ));
        assert_eq!(relay.registry().len(), 1);
    }

    #[test]
    fn timeouts_are_defaulted_and_clamped() {
        let relay = Relay::new(
            RelaySettings {
                default_timeout: Duration::from_secs(30),
                max_timeout: Duration::from_secs(60),
            },
            Arc::new(NoopObserver),
        );
        assert_eq!(relay.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(relay.effective_timeout(Some(Duration::ZERO)), Duration::from_secs(30));
        assert_eq!(
            relay.effective_timeout(Some(Duration::from_millis(200))),
            Duration::from_millis(200)
        );
        assert_eq!(
            relay.effective_timeout(Some(Duration::from_secs(600))),
            Duration::from_secs(60)
        );
    }
}
