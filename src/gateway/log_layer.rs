//! Tracing layer that mirrors relay log events to `/api/logs/events`.
//!
//! ```text
//! tracing::info!(channel = %id, "...")
//!        │
//!        ▼
//!   RelayLogLayer::on_event()  ── extracts message, fields, channel
//!        │
//!        ▼
//!   LogBroadcaster::send()
//!        ├──► broadcast::Sender<LogEntry>   live subscribers
//!        └──► ring buffer                   replay for late subscribers
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;

/// Entries kept for replay.
const HISTORY_CAP: usize = 500;

/// One log record as streamed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: String,
    pub target: String,
    pub message: String,
    /// Channel the record is about, taken from a `channel` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub timestamp: String,
}

impl LogEntry {
    /// Whether this entry should reach a subscriber filtering on `channel`.
    pub fn matches_channel(&self, channel: Option<&str>) -> bool {
        match channel {
            None => true,
            Some(wanted) => self.channel.as_deref() == Some(wanted),
        }
    }
}

/// Fans log entries out to SSE subscribers.
///
/// Built in `main.rs` before tracing is initialized and shared between
/// [`RelayLogLayer`] and the gateway.
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogEntry>,
    recent: Mutex<VecDeque<LogEntry>>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(512);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
        }
    }

    pub fn send(&self, entry: LogEntry) {
        if let Ok(mut buf) = self.recent.lock() {
            if buf.len() >= HISTORY_CAP {
                buf.pop_front();
            }
            buf.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// Snapshot of buffered entries, oldest first.
    pub fn recent_entries(&self) -> Vec<LogEntry> {
        self.recent
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    channel: Option<String>,
    fields: Vec<String>,
}

impl EntryVisitor {
    fn push_field(&mut self, name: &str, rendered: String) {
        if name == "channel" {
            self.channel = Some(rendered.clone());
        }
        self.fields.push(format!("{}={}", name, rendered));
    }

    /// "message key=val key=val"
    fn finish(self) -> (String, Option<String>) {
        let text = if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        };
        (text, self.channel)
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered.trim_matches('"').to_string();
        } else {
            self.push_field(field.name(), rendered.trim_matches('"').to_string());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), value.to_string());
        }
    }
}

/// Tracing layer that forwards events to a [`LogBroadcaster`].
///
/// Events more verbose than `max_level` are skipped.
pub struct RelayLogLayer {
    broadcaster: Arc<LogBroadcaster>,
    max_level: tracing::Level,
}

impl RelayLogLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self {
            broadcaster,
            max_level: tracing::Level::DEBUG,
        }
    }

    pub fn with_max_level(mut self, level: tracing::Level) -> Self {
        self.max_level = level;
        self
    }
}

impl<S: tracing::Subscriber> Layer<S> for RelayLogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);
        let (message, channel) = visitor.finish();

        self.broadcaster.send(LogEntry {
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
            channel,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
    }
}
