//! Observability subsystem: trait-based event and metric recording.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | `noop`  | Discards everything (default) |
//! | `log`   | Emits structured events via `tracing` |
//! | `multi` | Fan-out, built from a comma-separated backend list |
mod log;
mod multi;
mod noop;
pub mod traits;

use std::sync::Arc;

pub use self::log::LogObserver;
pub use self::multi::MultiObserver;
pub use self::noop::NoopObserver;
pub use self::traits::{Observer, ObserverEvent, ObserverMetric};

/// Configuration for the observability backend.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Backend name: "none", "noop", "log", or a comma-separated list.
    pub backend: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: "none".into(),
        }
    }
}

fn single_observer(name: &str) -> Option<Box<dyn Observer>> {
    match name.trim() {
        "log" => Some(Box::new(LogObserver)),
        "none" | "noop" | "" => None,
        other => {
            tracing::warn!(backend = other, "Unknown observability backend, ignoring");
            None
        }
    }
}

/// Create an observer from configuration.
///
/// Unknown or disabled backends resolve to [`NoopObserver`]; more than one
/// active backend yields a [`MultiObserver`].
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    let mut observers: Vec<Box<dyn Observer>> =
        config.backend.split(',').filter_map(single_observer).collect();
    match observers.len() {
        0 => Arc::new(NoopObserver),
        1 => Arc::from(observers.remove(0)),
        _ => Arc::new(MultiObserver::new(observers)),
    }
}

#[cfg(test)]
mod tests {
    use crate::observability::*;

    fn backend(name: &str) -> ObservabilityConfig {
        ObservabilityConfig {
            backend: name.into(),
        }
    }

    #[test]
    fn default_config_is_none() {
        assert_eq!(ObservabilityConfig::default().backend, "none");
    }

    #[test]
    fn factory_returns_noop_for_disabled_or_unknown() {
        for name in ["none", "noop", "", "prometheus"] {
            assert_eq!(create_observer(&backend(name)).name(), "noop", "{name}");
        }
    }

    #[test]
    fn factory_returns_log_for_log() {
        assert_eq!(create_observer(&backend("log")).name(), "log");
        assert_eq!(create_observer(&backend("noop, log")).name(), "log");
    }

    #[test]
    fn factory_returns_multi_for_several_backends() {
        assert_eq!(create_observer(&backend("log,log")).name(), "log+log");
    }
}
