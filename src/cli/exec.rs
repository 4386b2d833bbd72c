//! `exec` command: invoke one action and print its result.

use std::time::Duration;

use serde_json::Value;

use crate::client::RelayClient;
use crate::protocol::ChannelId;

pub async fn run_exec_command(
    relay_url: &str,
    channel: &str,
    action: &str,
    args: Option<&str>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let client = RelayClient::new(relay_url);
    let result = client
        .execute(
            &ChannelId::from(channel),
            action,
            args,
            timeout_ms.map(Duration::from_millis),
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Arguments given on the command line. Bare words that are not JSON are
/// sent as a single string argument.
fn parse_args(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}
