//! Shared broadcast-bus relay.
//!
//! Every participant sees every message. Requests and responses are matched
//! purely by `requestId`, so clients filter the bus for their own replies.
//!
//! ```text
//! BusClient ──publish OBR_REQUEST{r1}──►┐
//!                                      bus ──► BusServer ──► ActionDispatcher
//! BusClient ◄─filter requestId==r1────┘◄──publish OBR_RESPONSE{r1}──┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::executor::{ActionDispatcher, ActionExecutor};
use crate::observability::{NoopObserver, Observer};
use crate::protocol::{Args, ChannelId, Envelope, Invocation};
use crate::relay::{CallOutcome, CorrelationTable};

/// Timeout used by [`BusClient::request`].
pub const BUS_DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

const BUS_CAPACITY: usize = 256;

/// A named in-process broadcast bus of envelopes.
#[derive(Clone)]
pub struct Bus {
    name: ChannelId,
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(name: impl Into<ChannelId>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn name(&self) -> &ChannelId {
        &self.name
    }

    /// Publish to every current subscriber. Fire-and-forget.
    pub fn publish(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            tracing::debug!(bus = %self.name, "Published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

/// Answers requests seen on a bus.
pub struct BusServer {
    task: JoinHandle<()>,
}

impl BusServer {
    /// Start serving. Each request runs concurrently; each gets exactly one
    /// response published back on the bus.
    pub fn spawn<E: ActionExecutor>(bus: Bus, dispatcher: ActionDispatcher<E>) -> Self {
        let mut rx = bus.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let envelope = match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(bus = %bus.name(), skipped, "Bus server lagged, requests lost");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Envelope::Request(invocation) = envelope else {
                    continue;
                };
                let bus = bus.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let response = dispatcher.dispatch(invocation).await;
                    bus.publish(Envelope::Response(response));
                });
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Issues requests over a bus and waits for the matching response.
pub struct BusClient {
    bus: Bus,
    table: Arc<CorrelationTable>,
    listener: JoinHandle<()>,
    timeout: Duration,
}

impl BusClient {
    /// Subscribe to `bus`. The subscription exists before any request is
    /// published, so no reply can be missed.
    pub fn new(bus: Bus) -> Self {
        Self::with_observer(bus, Arc::new(NoopObserver))
    }

    pub fn with_observer(bus: Bus, observer: Arc<dyn Observer>) -> Self {
        let table = CorrelationTable::new(observer);
        let mut rx = bus.subscribe();
        let listener = {
            let table = Arc::clone(&table);
            let name = bus.name().clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(Envelope::Response(response)) => {
                            // Replies to other clients are not ours; dropping them is expected.
                            table.resolve(response, None);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(bus = %name, skipped, "Bus client lagged");
                        }
                        // Unreachable while this client holds its own sender.
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            bus,
            table,
            listener,
            timeout: BUS_DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish `action` and wait for its response or the timeout.
    pub async fn request(&self, action: &str, args: impl Into<Args>) -> CallOutcome {
        let call = self.table.begin(self.bus.name().clone(), action, self.timeout);
        let invocation = Invocation {
            request_id: call.request_id().clone(),
            ..Invocation::new(action, args)
        };
        self.bus.publish(Envelope::Request(invocation));
        call.wait().await
    }

    pub fn pending_count(&self) -> usize {
        self.table.len()
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
