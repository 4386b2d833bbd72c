//! Correlation table: pending calls keyed by request id.
//!
//! ```text
//!   begin() ──insert──► entries{request_id → PendingEntry} ◄──spawn── timer
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!      resolve()           expire()            fail_channel()
//!   (response arrived)   (timer fired)       (channel closed)
//!          └──────── whoever removes the entry settles it ────────┘
//! ```
//!
//! Removal from the map is the settle-once guard: the three settle paths
//! race only for the lock, and the loser finds nothing to remove.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::RelayError;
use crate::observability::{Observer, ObserverEvent, ObserverMetric};
use crate::protocol::{ActionResponse, ChannelId, RequestId};

/// Result delivered to the caller of a pending call.
pub type CallOutcome = Result<Value, RelayError>;

struct PendingEntry {
    target: ChannelId,
    action: String,
    sender: oneshot::Sender<CallOutcome>,
    timer: AbortHandle,
    started: Instant,
}

/// Caller-side handle of an in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    request_id: RequestId,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the call to settle.
    ///
    /// Every entry is settled by a response, its timer, or a channel sweep,
    /// so this always completes.
    pub async fn wait(self) -> CallOutcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(RelayError::Transport(format!(
                "pending request {} was dropped",
                self.request_id
            )))
        })
    }
}

/// Process-wide table of in-flight calls.
pub struct CorrelationTable {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
    observer: Arc<dyn Observer>,
}

impl CorrelationTable {
    pub fn new(observer: Arc<dyn Observer>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            observer,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a pending call targeting `target` with its timeout timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin(self: &Arc<Self>, target: ChannelId, action: &str, timeout: Duration) -> PendingCall {
        let (sender, rx) = oneshot::channel();
        let pending = {
            let mut entries = self.lock();
            let request_id = loop {
                let candidate = RequestId::generate();
                if !entries.contains_key(&candidate) {
                    break candidate;
                }
            };

            let table = Arc::downgrade(self);
            let timer_id = request_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                expire(table, &timer_id, timeout);
            })
            .abort_handle();

            entries.insert(
                request_id.clone(),
                PendingEntry {
                    target,
                    action: action.to_string(),
                    sender,
                    timer,
                    started: Instant::now(),
                },
            );
            self.observer
                .record_metric(&ObserverMetric::PendingRequests(entries.len() as u64));
            request_id
        };

        PendingCall {
            request_id: pending,
            rx,
        }
    }

    /// Settle the call matching `response.request_id`.
    ///
    /// When `from` is given, only an entry targeting that channel matches,
    /// so one channel cannot answer another channel's calls. Returns `false`
    /// when nothing matched; that is expected after a timeout or for
    /// duplicates and is not an error.
    pub fn resolve(&self, response: ActionResponse, from: Option<&ChannelId>) -> bool {
        let removed = {
            let mut entries = self.lock();
            let matches = entries
                .get(&response.request_id)
                .is_some_and(|entry| from.is_none_or(|channel| *channel == entry.target));
            if matches {
                entries.remove(&response.request_id)
            } else {
                None
            }
        };

        let Some(entry) = removed else {
            tracing::debug!(request_id = %response.request_id, "Dropping response for unknown request");
            self.observer.record_event(&ObserverEvent::ResponseDropped {
                request_id: response.request_id.to_string(),
            });
            return false;
        };

        let outcome = response.into_outcome(&entry.action);
        self.finish(entry, outcome);
        true
    }

    /// Settle a call with an error, if it is still pending.
    pub fn reject(&self, request_id: &RequestId, error: RelayError) -> bool {
        let removed = self.lock().remove(request_id);
        match removed {
            Some(entry) => {
                self.finish(entry, Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every call targeting `channel` with `ChannelClosed`.
    ///
    /// Returns how many calls were rejected.
    pub fn fail_channel(&self, channel: &ChannelId) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut entries = self.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.target == *channel)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        let count = failed.len();
        for entry in failed {
            self.finish(
                entry,
                Err(RelayError::ChannelClosed {
                    channel: channel.clone(),
                }),
            );
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn finish(&self, entry: PendingEntry, outcome: CallOutcome) {
        entry.timer.abort();
        let elapsed = entry.started.elapsed();
        let label = match &outcome {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.observer.record_event(&ObserverEvent::InvocationSettled {
            action: entry.action,
            duration: elapsed,
            outcome: label.to_string(),
        });
        self.observer.record_metric(&ObserverMetric::CallLatency(elapsed));
        self.observer
            .record_metric(&ObserverMetric::PendingRequests(self.len() as u64));
        // The caller may have stopped waiting; that is fine.
        let _ = entry.sender.send(outcome);
    }
}

fn expire(table: Weak<CorrelationTable>, request_id: &RequestId, timeout: Duration) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let removed = table.lock().remove(request_id);
    if let Some(entry) = removed {
        tracing::warn!(
            request_id = %request_id,
            channel = %entry.target,
            action = %entry.action,
            timeout_ms = timeout.as_millis() as u64,
            "Request timed out"
        );
        let error = RelayError::Timeout {
            request_id: request_id.clone(),
            action: entry.action.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        table.finish(entry, Err(error));
    }
}
