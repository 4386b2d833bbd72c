//! Channel registry: which channels exist and how to push to them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::protocol::{
    ChannelId, ChannelState, ChannelSummary, Envelope, Metadata, TransportKind, merge_metadata,
};

/// Push side of a channel's transport. Owned by the registry entry.
pub type TransportHandle = mpsc::UnboundedSender<Envelope>;

struct ChannelEntry {
    handle: TransportHandle,
    metadata: Metadata,
    connected_at: DateTime<Utc>,
    state: ChannelState,
    transport: TransportKind,
}

impl ChannelEntry {
    fn summary(&self, id: &ChannelId) -> ChannelSummary {
        ChannelSummary {
            id: id.clone(),
            metadata: self.metadata.clone(),
            is_online: self.state == ChannelState::Open && !self.handle.is_closed(),
            state: self.state,
            transport: self.transport,
            connected_at: self.connected_at,
        }
    }
}

/// Tracks live channels keyed by id.
///
/// Every check-then-act sequence happens inside a single lock scope, and no
/// method awaits, so registration and removal are atomic with respect to
/// each other.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a channel under a fresh id, directly in the OPEN state.
    pub fn register(&self, handle: TransportHandle, transport: TransportKind) -> ChannelId {
        self.insert_fresh(handle, transport, ChannelState::Open)
    }

    /// Register a channel that still has a handshake to complete.
    ///
    /// CONNECTING channels are listed but not routable until [`mark_open`].
    ///
    /// [`mark_open`]: ChannelRegistry::mark_open
    pub fn register_connecting(
        &self,
        handle: TransportHandle,
        transport: TransportKind,
    ) -> ChannelId {
        self.insert_fresh(handle, transport, ChannelState::Connecting)
    }

    fn insert_fresh(
        &self,
        handle: TransportHandle,
        transport: TransportKind,
        state: ChannelState,
    ) -> ChannelId {
        let mut channels = self.lock();
        let id = loop {
            let candidate = ChannelId::generate();
            if !channels.contains_key(&candidate) {
                break candidate;
            }
        };
        channels.insert(id.clone(), new_entry(handle, transport, state));
        id
    }

    /// Register a channel under an id chosen by the channel itself.
    pub fn register_as(
        &self,
        id: ChannelId,
        handle: TransportHandle,
        transport: TransportKind,
        state: ChannelState,
    ) -> Result<(), ChannelError> {
        let mut channels = self.lock();
        if channels.contains_key(&id) {
            return Err(ChannelError::IdTaken { id });
        }
        channels.insert(id, new_entry(handle, transport, state));
        Ok(())
    }

    /// Complete the handshake: CONNECTING -> OPEN.
    pub fn mark_open(&self, id: &ChannelId) -> Result<(), ChannelError> {
        let mut channels = self.lock();
        let entry = channels
            .get_mut(id)
            .ok_or_else(|| ChannelError::NotFound { id: id.clone() })?;
        entry.state = ChannelState::Open;
        Ok(())
    }

    /// Shallow-merge `partial` into the channel's metadata and return the result.
    pub fn update_metadata(
        &self,
        id: &ChannelId,
        partial: Metadata,
    ) -> Result<Metadata, ChannelError> {
        let mut channels = self.lock();
        let entry = channels
            .get_mut(id)
            .ok_or_else(|| ChannelError::NotFound { id: id.clone() })?;
        merge_metadata(&mut entry.metadata, partial);
        Ok(entry.metadata.clone())
    }

    /// Remove a channel. Returns its final summary, or `None` if it was
    /// already gone, which makes repeated calls harmless.
    pub fn unregister(&self, id: &ChannelId) -> Option<ChannelSummary> {
        let entry = self.lock().remove(id)?;
        let mut summary = entry.summary(id);
        summary.state = ChannelState::Closed;
        summary.is_online = false;
        Some(summary)
    }

    /// Snapshot of all channels, sorted by connection time.
    pub fn list(&self) -> Vec<ChannelSummary> {
        let mut list: Vec<ChannelSummary> = self
            .lock()
            .iter()
            .map(|(id, entry)| entry.summary(id))
            .collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn get(&self, id: &ChannelId) -> Option<ChannelSummary> {
        self.lock().get(id).map(|entry| entry.summary(id))
    }

    /// Whether `id` is registered and accepting invocations.
    pub fn is_routable(&self, id: &ChannelId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|entry| entry.state == ChannelState::Open)
    }

    /// Push an envelope to a channel.
    ///
    /// Fails with `NotFound` for unknown or still-connecting channels and
    /// with `Closed` when the transport went away before the registry heard
    /// about it. Nothing is enqueued in either case.
    pub fn send(&self, id: &ChannelId, envelope: Envelope) -> Result<(), ChannelError> {
        let channels = self.lock();
        let entry = channels
            .get(id)
            .filter(|entry| entry.state == ChannelState::Open)
            .ok_or_else(|| ChannelError::NotFound { id: id.clone() })?;
        entry
            .handle
            .send(envelope)
            .map_err(|_| ChannelError::Closed { id: id.clone() })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn new_entry(handle: TransportHandle, transport: TransportKind, state: ChannelState) -> ChannelEntry {
    ChannelEntry {
        handle,
        metadata: Metadata::new(),
        connected_at: Utc::now(),
        state,
        transport,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn handle() -> (TransportHandle, mpsc::UnboundedReceiver<Envelope>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_and_get() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = handle();
        let id = registry.register(tx, TransportKind::Sse);

        let summary = registry.get(&id).expect("registered");
        assert_eq!(summary.state, ChannelState::Open);
        assert!(summary.is_online);
        assert_eq!(summary.transport, TransportKind::Sse);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_registrations_get_unique_ids() {
        let registry = Arc::new(ChannelRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            let (tx, _rx) = mpsc::unbounded_channel();
                            registry.register(tx, TransportKind::WebSocket)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert!(seen.insert(id), "duplicate channel id");
            }
        }
        assert_eq!(registry.len(), 2000);
    }

    #[test]
    fn register_as_rejects_live_id() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("tab_fixed");
        let (tx, _rx) = handle();
        registry
            .register_as(id.clone(), tx, TransportKind::Sse, ChannelState::Open)
            .unwrap();

        let (tx2, _rx2) = handle();
        let err = registry
            .register_as(id.clone(), tx2, TransportKind::Sse, ChannelState::Open)
            .unwrap_err();
        assert_eq!(err, ChannelError::IdTaken { id: id.clone() });

        // Free again after unregister.
        registry.unregister(&id);
        let (tx3, _rx3) = handle();
        assert!(
            registry
                .register_as(id, tx3, TransportKind::Sse, ChannelState::Open)
                .is_ok()
        );
    }

    #[test]
    fn connecting_channel_is_not_routable_until_open() {
        let registry = ChannelRegistry::new();
        let (tx, mut rx) = handle();
        let id = registry.register_connecting(tx, TransportKind::WebSocket);

        assert_eq!(registry.get(&id).unwrap().state, ChannelState::Connecting);
        assert!(!registry.is_routable(&id));
        assert!(matches!(
            registry.send(&id, Envelope::Ping),
            Err(ChannelError::NotFound { .. })
        ));

        registry.mark_open(&id).unwrap();
        assert!(registry.is_routable(&id));
        registry.send(&id, Envelope::Ping).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Envelope::Ping);
    }

    #[test]
    fn metadata_merges_last_write_wins() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = handle();
        let id = registry.register(tx, TransportKind::Sse);

        let first = json!({"playerName": "Ann", "roomId": "r1"});
        registry
            .update_metadata(&id, first.as_object().cloned().unwrap())
            .unwrap();
        let second = json!({"roomId": "r2"});
        let merged = registry
            .update_metadata(&id, second.as_object().cloned().unwrap())
            .unwrap();

        assert_eq!(
            serde_json::Value::Object(merged),
            json!({"playerName": "Ann", "roomId": "r2"})
        );
    }

    #[test]
    fn unknown_channel_is_distinguishable() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::from("missing");
        assert!(registry.get(&id).is_none());
        assert!(matches!(
            registry.update_metadata(&id, Metadata::new()),
            Err(ChannelError::NotFound { .. })
        ));
        assert!(matches!(
            registry.send(&id, Envelope::Ping),
            Err(ChannelError::NotFound { .. })
        ));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = handle();
        let id = registry.register(tx, TransportKind::Sse);

        let closed = registry.unregister(&id).expect("first unregister");
        assert_eq!(closed.state, ChannelState::Closed);
        assert!(!closed.is_online);
        assert!(registry.unregister(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn send_to_dropped_receiver_reports_closed() {
        let registry = ChannelRegistry::new();
        let (tx, rx) = handle();
        let id = registry.register(tx, TransportKind::Sse);
        drop(rx);

        assert!(!registry.get(&id).unwrap().is_online);
        assert!(matches!(
            registry.send(&id, Envelope::Ping),
            Err(ChannelError::Closed { .. })
        ));
    }

    #[test]
    fn list_is_a_snapshot() {
        let registry = ChannelRegistry::new();
        let (tx1, _rx1) = handle();
        let (tx2, _rx2) = handle();
        let a = registry.register(tx1, TransportKind::Sse);
        registry.register(tx2, TransportKind::WebSocket);

        let snapshot = registry.list();
        registry.unregister(&a);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.list().len(), 1);
    }
}
