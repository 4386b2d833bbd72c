//! `channels` command: print the relay's channel table.

use crate::client::RelayClient;

pub async fn run_channels_command(relay_url: &str) -> anyhow::Result<()> {
    let client = RelayClient::new(relay_url);
    let channels = client.list_channels().await?;

    if channels.is_empty() {
        println!("No channels connected to {}", client.base_url());
        return Ok(());
    }

    println!("{} channel(s) on {}\n", channels.len(), client.base_url());
    for channel in channels {
        println!(
            "  {:<32} {:<10} {:<9} since {}",
            channel.id.as_str(),
            channel.state.to_string(),
            channel.transport.to_string(),
            channel.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
        if !channel.metadata.is_empty() {
            println!("  {:<32} {}", "", serde_json::Value::Object(channel.metadata));
        }
    }
    Ok(())
}
