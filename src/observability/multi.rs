//! Observer that forwards to several backends at once.

use crate::observability::traits::{Observer, ObserverEvent, ObserverMetric};

/// Forwards every event, metric and flush to each inner backend in order.
///
/// Reports its name as the inner names joined with `+`, e.g. `log+audit`.
pub struct MultiObserver {
    backends: Vec<Box<dyn Observer>>,
    name: String,
}

impl MultiObserver {
    pub fn new(backends: Vec<Box<dyn Observer>>) -> Self {
        let name = if backends.is_empty() {
            "multi".to_string()
        } else {
            backends
                .iter()
                .map(|b| b.name())
                .collect::<Vec<_>>()
                .join("+")
        };
        Self { backends, name }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn Observer)) {
        self.backends.iter().for_each(|b| f(b.as_ref()));
    }
}

impl Observer for MultiObserver {
    fn record_event(&self, event: &ObserverEvent) {
        self.each(|b| b.record_event(event));
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        self.each(|b| b.record_metric(metric));
    }

    fn flush(&self) {
        self.each(|b| b.flush());
    }

    fn name(&self) -> &str {
        &self.name
    }
}
