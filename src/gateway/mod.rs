//! HTTP + SSE and WebSocket front end of the relay.
//!
//! ```text
//! tab    ─── GET  /channels/{id} ─────► SSE stream of OBR_REQUEST + pings
//! tab    ─── POST /response/{id} ─────► Relay::on_response
//! caller ─── POST /execute/{id} ──────► Relay::invoke ─► 200/404/408/422/502
//! any    ─── GET  /ws ────────────────► REGISTER_CLIENT, requests, responses
//! ops    ─── GET  /channels, /api/status, /api/logs/events
//! ```

pub mod log_layer;
pub mod server;
pub mod sse;
pub mod types;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ServerError;
use crate::relay::Relay;

use self::log_layer::LogBroadcaster;
use self::server::GatewayState;

/// Counts live connections of one transport.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    count: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection until the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Decrements its tracker on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    /// Keep-alive interval for SSE and WebSocket connections.
    pub keepalive: Duration,
    /// CORS origins; empty allows any origin.
    pub allowed_origins: Vec<String>,
}

/// The relay's network front end.
pub struct RelayGateway {
    config: GatewayConfig,
    state: Arc<GatewayState>,
}

impl RelayGateway {
    pub fn new(config: GatewayConfig, relay: Arc<Relay>) -> Self {
        let state = Arc::new(GatewayState::new(relay, config.keepalive));
        Self { config, state }
    }

    /// Stream tracing output at `/api/logs/events`.
    pub fn with_log_broadcaster(self, broadcaster: Arc<LogBroadcaster>) -> Self {
        let mut state = GatewayState::new(Arc::clone(&self.state.relay), self.config.keepalive);
        state.log_broadcaster = Some(broadcaster);
        Self {
            config: self.config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        server::start_server(
            self.config.addr,
            Arc::clone(&self.state),
            &self.config.allowed_origins,
        )
        .await
    }

    /// Ask the server task to stop accepting connections.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.state.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}
