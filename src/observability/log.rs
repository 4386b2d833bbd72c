//! Tracing-based observer that emits structured log events.
//!
//! Events land in the normal application log, so this backend needs no
//! extra dependencies.
use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Observer that logs events and metrics via `tracing`.
pub struct LogObserver;

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::ChannelOpened { channel, transport } => {
                tracing::info!(channel, transport, "observer: channel.opened");
            }
            ObserverEvent::ChannelClosed { channel, rejected } => {
                tracing::info!(channel, rejected, "observer: channel.closed");
            }
            ObserverEvent::InvocationSent { channel, action } => {
                tracing::debug!(channel, action, "observer: invocation.sent");
            }
            ObserverEvent::InvocationSettled {
                action,
                duration,
                outcome,
            } => {
                tracing::info!(
                    action,
                    duration_ms = duration.as_millis() as u64,
                    outcome,
                    "observer: invocation.settled"
                );
            }
            ObserverEvent::ResponseDropped { request_id } => {
                tracing::debug!(request_id, "observer: response.dropped");
            }
            ObserverEvent::TransportError { transport, message } => {
                tracing::warn!(transport, error = message.as_str(), "observer: transport.error");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::CallLatency(d) => {
                tracing::debug!(
                    latency_ms = d.as_millis() as u64,
                    "observer: metric.call_latency"
                );
            }
            ObserverMetric::PendingRequests(n) => {
                tracing::debug!(pending = n, "observer: metric.pending_requests");
            }
            ObserverMetric::ActiveChannels(n) => {
                tracing::debug!(channels = n, "observer: metric.active_channels");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
