//! Axum HTTP server for the relay gateway.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{ChannelError, RelayError, ServerError};
use crate::gateway::ConnectionTracker;
use crate::gateway::log_layer::LogBroadcaster;
use crate::gateway::sse::{ChannelStream, open_channel_stream};
use crate::gateway::types::*;
use crate::protocol::{ChannelId, Metadata};
use crate::relay::Relay;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub relay: Arc<Relay>,
    /// Keep-alive interval for SSE and WebSocket connections.
    pub keepalive: Duration,
    /// Log broadcaster for the logs SSE endpoint.
    pub log_broadcaster: Option<Arc<LogBroadcaster>>,
    pub sse_tracker: Arc<ConnectionTracker>,
    pub ws_tracker: Arc<ConnectionTracker>,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(relay: Arc<Relay>, keepalive: Duration) -> Self {
        Self {
            relay,
            keepalive,
            log_broadcaster: None,
            sse_tracker: Arc::new(ConnectionTracker::new()),
            ws_tracker: Arc::new(ConnectionTracker::new()),
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }
}

type ApiError = (StatusCode, Json<ExecuteResponse>);

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>, allowed_origins: &[String]) -> Router {
    let routes = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/logs/events", get(logs_events_handler))
        // Channel side
        .route("/connect", get(connect_handler))
        .route("/channels", get(channels_list_handler))
        .route("/channels/{id}", get(channel_stream_handler))
        .route("/channels/{id}/metadata", post(channel_metadata_handler))
        .route("/actions/{id}", get(channel_stream_handler))
        .route("/response/{id}", post(response_handler))
        .route("/ws", get(super::ws::ws_handler))
        // Caller side
        .route("/execute/{id}", post(execute_handler))
        .route("/tabs", get(tabs_list_handler));

    routes
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    // Tabs live on the tabletop's own origin, so any origin is the default.
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    allowed_origins: &[String],
) -> Result<SocketAddr, ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::StartupFailed {
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ServerError::StartupFailed {
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(Arc::clone(&state), allowed_origins);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Relay gateway shutting down");
            })
            .await
        {
            tracing::error!("Relay gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "Relay gateway listening");
    Ok(bound_addr)
}

/// HTTP status for a failed call.
pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::ChannelNotFound { .. } => StatusCode::NOT_FOUND,
        RelayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        RelayError::ActionNotFound { .. } | RelayError::ActionFailed(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RelayError::ChannelClosed { .. } => StatusCode::BAD_GATEWAY,
        RelayError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn query_metadata(params: HashMap<String, String>) -> Metadata {
    params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect()
}

// --- Health / status ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "obr-relay".to_string(),
    })
}

async fn status_handler(State(state): State<Arc<GatewayState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        channels: state.relay.registry().len(),
        sse_connections: state.sse_tracker.connection_count(),
        ws_connections: state.ws_tracker.connection_count(),
        pending_requests: state.relay.pending_count(),
    })
}

// --- Channel side ---

/// `GET /connect`: relay picks the id and announces it as the first event.
async fn connect_handler(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<ChannelStream>, (StatusCode, String)> {
    open_channel_stream(&state, None, query_metadata(params)).map_err(channel_error_status)
}

/// `GET /channels/{id}` and `GET /actions/{id}`: the tab picks its id.
async fn channel_stream_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<ChannelStream>, (StatusCode, String)> {
    open_channel_stream(&state, Some(ChannelId::from(id)), query_metadata(params))
        .map_err(channel_error_status)
}

fn channel_error_status(error: ChannelError) -> (StatusCode, String) {
    let status = match error {
        ChannelError::IdTaken { .. } => StatusCode::CONFLICT,
        ChannelError::NotFound { .. } => StatusCode::NOT_FOUND,
        ChannelError::Closed { .. } => StatusCode::GONE,
    };
    (status, error.to_string())
}

async fn channel_metadata_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(partial): Json<Metadata>,
) -> Result<Json<MetadataResponse>, (StatusCode, String)> {
    let channel_id = ChannelId::from(id);
    let metadata = state
        .relay
        .registry()
        .update_metadata(&channel_id, partial)
        .map_err(channel_error_status)?;
    Ok(Json(MetadataResponse {
        channel_id,
        metadata,
    }))
}

async fn response_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(submission): Json<ResponseSubmission>,
) -> Result<Json<AckResponse>, (StatusCode, Json<AckResponse>)> {
    let channel_id = ChannelId::from(id);
    let request_id = submission.request_id.clone();
    if state
        .relay
        .on_response(Some(&channel_id), submission.into_response())
    {
        Ok(Json(AckResponse {
            success: true,
            error: None,
        }))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(AckResponse {
                success: false,
                error: Some(format!("Request {} not found", request_id)),
            }),
        ))
    }
}

// --- Caller side ---

async fn execute_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let channel_id = ChannelId::from(id);
    let timeout = req.timeout.map(Duration::from_millis);

    match state
        .relay
        .invoke(&channel_id, &req.action, req.args, timeout)
        .await
    {
        Ok(result) => Ok(Json(ExecuteResponse::ok(result))),
        Err(e) => {
            tracing::info!(channel = %channel_id, action = %req.action, error = %e, "Execute failed");
            Err((status_for(&e), Json(ExecuteResponse::err(&e))))
        }
    }
}

async fn channels_list_handler(
    State(state): State<Arc<GatewayState>>,
) -> Json<ChannelListResponse> {
    Json(ChannelListResponse {
        channels: state.relay.registry().list(),
    })
}

async fn tabs_list_handler(State(state): State<Arc<GatewayState>>) -> Json<TabListResponse> {
    Json(TabListResponse {
        tabs: state
            .relay
            .registry()
            .list()
            .into_iter()
            .map(|summary| summary.id)
            .collect(),
    })
}

// --- Logs ---

#[derive(Debug, Deserialize)]
struct LogsQuery {
    channel: Option<String>,
}

async fn logs_events_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<LogsQuery>,
) -> Result<
    Sse<impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static>,
    (StatusCode, String),
> {
    let broadcaster = state.log_broadcaster.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "Log broadcaster not available".to_string(),
    ))?;

    // Subscribe before snapshotting so nothing falls between history and live.
    let rx = broadcaster.subscribe();
    let history = broadcaster.recent_entries();
    let channel = query.channel;
    let live_channel = channel.clone();

    let history_stream = futures::stream::iter(history)
        .filter(move |entry| entry.matches_channel(channel.as_deref()));
    let live_stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .filter(move |entry| entry.matches_channel(live_channel.as_deref()));

    let stream = history_stream.chain(live_stream).map(|entry| {
        let data = serde_json::to_string(&entry).unwrap_or_default();
        Ok(Event::default().event("log").data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keepalive).text("")))
}
