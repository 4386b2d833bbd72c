//! End-to-end integration tests for the WebSocket relay.
//!
//! These tests start a real Axum server on a random port, connect WebSocket
//! clients, and verify the full message flow:
//! - Ping/pong and the registration handshake
//! - Requests before registration
//! - Self-invocation and cross-channel invocation
//! - HTTP callers reaching WebSocket tabs
//! - Pending calls fail when the target socket closes
//! - Connection tracking
//! - Keep-alive for idle clients

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use obr_relay::client::RelayClient;
use obr_relay::executor::{ActionDispatcher, TabletopExecutor};
use obr_relay::gateway::server::{GatewayState, start_server};
use obr_relay::observability::NoopObserver;
use obr_relay::protocol::ChannelId;
use obr_relay::relay::{Relay, RelaySettings};
use obr_relay::tab::WsTabClient;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_test_server() -> (SocketAddr, Arc<GatewayState>) {
    start_test_server_with_keepalive(Duration::from_secs(30)).await
}

async fn start_test_server_with_keepalive(keepalive: Duration) -> (SocketAddr, Arc<GatewayState>) {
    let relay = Relay::new(RelaySettings::default(), Arc::new(NoopObserver));
    let state = Arc::new(GatewayState::new(relay, keepalive));

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound_addr = start_server(addr, state.clone(), &[])
        .await
        .expect("Failed to start test server");

    (bound_addr, state)
}

async fn connect_ws(addr: SocketAddr) -> WsStream {
    let url = format!("ws://{}/ws", addr);
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .expect("Failed to connect WebSocket");
    stream
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Read the next JSON text frame, with a timeout.
async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = timeout(TIMEOUT, ws.next())
        .await
        .expect("Timed out waiting for WS message")
        .expect("Stream ended")
        .expect("WS error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("Expected Text frame, got {:?}", other),
    }
}

/// Register and return the relay-assigned channel id.
async fn register(ws: &mut WsStream, metadata: Value) -> String {
    send_json(ws, json!({"type": "REGISTER_CLIENT", "metadata": metadata})).await;
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "CLIENT_REGISTERED");
    assert_eq!(ack["success"], true);
    ack["channelId"].as_str().unwrap().to_string()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_ws_ping_pong() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "pong");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_register_lists_channel() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;
    let id = register(&mut ws, json!({"playerName": "Ann"})).await;
    assert!(id.starts_with("tab_"));

    let channels = RelayClient::new(format!("http://{}", addr))
        .list_channels()
        .await
        .unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id.as_str(), id);
    assert_eq!(channels[0].transport.to_string(), "websocket");
    assert_eq!(channels[0].metadata["playerName"], "Ann");
}

#[tokio::test]
async fn test_request_before_registration_is_refused() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;

    send_json(
        &mut ws,
        json!({"type": "OBR_ACTION_REQUEST", "requestId": "c1", "action": "echo", "args": ["x"]}),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "OBR_RESPONSE");
    assert_eq!(reply["requestId"], "c1");
    assert_eq!(reply["success"], false);
}

#[tokio::test]
async fn test_list_clients_and_update_metadata() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;
    let id = register(&mut ws, json!({})).await;

    send_json(
        &mut ws,
        json!({"type": "UPDATE_METADATA", "metadata": {"roomId": "r1"}}),
    )
    .await;
    send_json(&mut ws, json!({"type": "LIST_CLIENTS", "requestId": "l1"})).await;

    let list = recv_json(&mut ws).await;
    assert_eq!(list["type"], "CLIENTS_LIST");
    assert_eq!(list["requestId"], "l1");
    assert_eq!(list["clients"][0]["id"], id);
    assert_eq!(list["clients"][0]["metadata"]["roomId"], "r1");
}

#[tokio::test]
async fn test_self_invocation_round_trip() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;
    let id = register(&mut ws, json!({})).await;

    send_json(
        &mut ws,
        json!({"type": "OBR_ACTION_REQUEST", "requestId": "c1", "action": "echo", "args": ["x"]}),
    )
    .await;

    // The relay forwards to this same socket under its own id.
    let forwarded = recv_json(&mut ws).await;
    assert_eq!(forwarded["type"], "OBR_REQUEST");
    assert_eq!(forwarded["fromChannelId"], id);
    let relay_id = forwarded["requestId"].as_str().unwrap().to_string();
    assert_ne!(relay_id, "c1");

    send_json(
        &mut ws,
        json!({"type": "OBR_RESPONSE", "requestId": relay_id, "success": true, "data": "x"}),
    )
    .await;

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "OBR_RESPONSE");
    assert_eq!(reply["requestId"], "c1");
    assert_eq!(reply["success"], true);
    assert_eq!(reply["data"], "x");
}

#[tokio::test]
async fn test_cross_channel_invocation() {
    let (addr, _state) = start_test_server().await;
    let base = format!("http://{}", addr);
    let tab = WsTabClient::new(
        base.as_str(),
        ActionDispatcher::new(Arc::new(TabletopExecutor::new("Ann"))),
    )
    .connect()
    .await
    .unwrap();

    let mut caller = connect_ws(addr).await;
    register(&mut caller, json!({"role": "agent"})).await;

    send_json(
        &mut caller,
        json!({
            "type": "OBR_ACTION_REQUEST",
            "requestId": "c2",
            "targetChannelId": tab.channel_id(),
            "action": "setRoomMetadata",
            "args": [{"mood": "tense"}]
        }),
    )
    .await;
    let reply = recv_json(&mut caller).await;
    assert_eq!(reply["requestId"], "c2");
    assert_eq!(reply["success"], true);
    assert_eq!(reply["data"]["mood"], "tense");

    send_json(
        &mut caller,
        json!({
            "type": "OBR_ACTION_REQUEST",
            "requestId": "c3",
            "targetChannelId": tab.channel_id(),
            "action": "doesNotExist"
        }),
    )
    .await;
    let reply = recv_json(&mut caller).await;
    assert_eq!(reply["requestId"], "c3");
    assert_eq!(reply["success"], false);
    assert_eq!(reply["error"], "Action 'doesNotExist' not found");
    assert!(reply["availableActions"].is_array());
}

#[tokio::test]
async fn test_unknown_target_fails_fast() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;
    register(&mut ws, json!({})).await;

    let start = Instant::now();
    send_json(
        &mut ws,
        json!({
            "type": "OBR_ACTION_REQUEST",
            "requestId": "c4",
            "targetChannelId": "tab_missing",
            "action": "echo"
        }),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["requestId"], "c4");
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("not found"));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_http_caller_reaches_ws_tab() {
    let (addr, _state) = start_test_server().await;
    let base = format!("http://{}", addr);
    let tab = WsTabClient::new(
        base.as_str(),
        ActionDispatcher::new(Arc::new(TabletopExecutor::new("Ann"))),
    )
    .connect()
    .await
    .unwrap();

    let result = RelayClient::new(base.as_str())
        .execute(
            tab.channel_id(),
            "createShape",
            json!([{"name": "Door", "shapeType": "RECTANGLE"}]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(result["name"], "Door");
    assert_eq!(result["type"], "SHAPE");
}

#[tokio::test]
async fn test_socket_close_fails_pending_call() {
    let (addr, state) = start_test_server().await;
    let mut target = connect_ws(addr).await;
    let id = register(&mut target, json!({})).await;

    let base = format!("http://{}", addr);
    let channel = ChannelId::from(id.as_str());
    let caller = tokio::spawn(async move {
        let resp = reqwest::Client::new()
            .post(format!("{}/execute/{}", base, channel))
            .json(&json!({"action": "echo", "args": ["x"], "timeout": 20000}))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap();
        (status, body)
    });

    // Wait for the forwarded request so the call is known to be pending.
    let forwarded = recv_json(&mut target).await;
    assert_eq!(forwarded["type"], "OBR_REQUEST");

    let start = Instant::now();
    target.close(None).await.unwrap();

    let (status, body) = timeout(TIMEOUT, caller).await.unwrap().unwrap();
    assert_eq!(status, 502);
    assert_eq!(body["kind"], "channel_closed");
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(state.relay.pending_count(), 0);
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let (addr, _state) = start_test_server().await;
    let mut ws = connect_ws(addr).await;
    register(&mut ws, json!({})).await;

    ws.send(Message::text("{not json")).await.unwrap();
    send_json(&mut ws, json!({"type": "SOMETHING_ELSE"})).await;
    send_json(&mut ws, json!({"type": "ping"})).await;

    // Only the pong comes back; the connection survived.
    assert_eq!(recv_json(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn test_ws_connection_tracking() {
    let (addr, state) = start_test_server().await;
    assert_eq!(state.ws_tracker.connection_count(), 0);

    let mut ws = connect_ws(addr).await;
    register(&mut ws, json!({})).await;
    assert_eq!(state.ws_tracker.connection_count(), 1);
    assert_eq!(state.relay.registry().len(), 1);

    ws.close(None).await.unwrap();
    let tracker = Arc::clone(&state.ws_tracker);
    wait_for(|| tracker.connection_count() == 0).await;
    wait_for(|| state.relay.registry().is_empty()).await;
}

#[tokio::test]
async fn test_idle_client_survives_keepalive() {
    let (addr, state) = start_test_server_with_keepalive(Duration::from_millis(100)).await;
    let mut ws = connect_ws(addr).await;
    let id = register(&mut ws, json!({})).await;

    // Keep reading so tungstenite flushes its automatic pongs, but never
    // answer the JSON pings.
    let deadline = Instant::now() + Duration::from_millis(600);
    let mut json_pings = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, ws.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["type"] == "ping" {
                    json_pings += 1;
                }
            }
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("socket closed while idle: {:?}", other),
        }
    }

    assert!(json_pings >= 2, "saw {} pings", json_pings);
    assert_eq!(state.ws_tracker.connection_count(), 1);
    let channels = state.relay.registry().list();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id.as_str(), id);
}
