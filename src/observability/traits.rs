//! Core observer trait and event/metric types.
use std::time::Duration;

/// Backend-agnostic observer for relay lifecycle events and metrics.
///
/// The relay records events at channel and call lifecycle points; the
/// observer decides what to do with them (log, export, discard).
///
/// Shared as `Arc<dyn Observer>` between the registry, the correlation
/// table and the transports.
pub trait Observer: Send + Sync {
    /// Record a discrete lifecycle event.
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric sample.
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data. No-op by default.
    fn flush(&self) {}

    /// Human-readable backend name (e.g. "noop", "log").
    fn name(&self) -> &str;
}

/// Discrete lifecycle events the relay can emit.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A channel finished registering.
    ChannelOpened { channel: String, transport: String },

    /// A channel was unregistered; `rejected` pending calls failed with it.
    ChannelClosed { channel: String, rejected: usize },

    /// An invocation was pushed to a channel.
    InvocationSent { channel: String, action: String },

    /// A pending call settled.
    InvocationSettled {
        action: String,
        duration: Duration,
        /// `"success"` or the error kind.
        outcome: String,
    },

    /// A response arrived for an unknown or already-settled request.
    ResponseDropped { request_id: String },

    /// A frame could not be decoded or delivered.
    TransportError { transport: String, message: String },
}

/// Numeric metric samples.
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    /// Round-trip latency of a settled call (histogram-style).
    CallLatency(Duration),

    /// Calls currently awaiting a response (gauge).
    PendingRequests(u64),

    /// Channels currently registered (gauge).
    ActiveChannels(u64),
}
