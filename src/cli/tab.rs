//! `tab` command: serve an in-memory tabletop over the relay.

use std::sync::Arc;

use serde_json::Value;

use crate::config::TransportChoice;
use crate::executor::{ActionDispatcher, TabletopExecutor};
use crate::protocol::{ChannelId, Metadata};
use crate::tab::{SseTabClient, TabHandle, WsTabClient};

pub async fn run_tab_command(
    relay_url: &str,
    transport: TransportChoice,
    channel_id: Option<String>,
    name: &str,
) -> anyhow::Result<()> {
    let dispatcher = ActionDispatcher::new(Arc::new(TabletopExecutor::new(name)));

    let handle: TabHandle = match transport {
        TransportChoice::Sse => {
            let id = channel_id.map(ChannelId::from).unwrap_or_else(ChannelId::generate);
            SseTabClient::new(relay_url, id, dispatcher)
                .with_metadata("playerName", name)
                .connect()
                .await?
        }
        TransportChoice::WebSocket => {
            if channel_id.is_some() {
                tracing::warn!("--channel-id is ignored for WebSocket tabs; the relay assigns one");
            }
            let mut metadata = Metadata::new();
            metadata.insert("playerName".to_string(), Value::String(name.to_string()));
            WsTabClient::new(relay_url, dispatcher)
                .with_metadata(metadata)
                .connect()
                .await?
        }
    };

    println!("Serving tabletop actions as channel {}", handle.channel_id());
    println!("Press Ctrl+C to stop.");

    tokio::select! {
        result = handle.join() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping tab");
        }
    }
    Ok(())
}
