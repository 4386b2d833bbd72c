//! obr-relay - Main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use obr_relay::{
    cli::{Cli, Command, run_channels_command, run_exec_command, run_tab_command},
    config::Config,
    gateway::{
        GatewayConfig, RelayGateway,
        log_layer::{LogBroadcaster, RelayLogLayer},
    },
    observability::create_observer,
    relay::Relay,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let relay_url = cli.relay_url.clone().unwrap_or_else(|| config.relay_url.clone());

    // Client commands only need plain logging
    if !cli.should_serve() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .init();

        return match cli.command {
            Some(Command::Channels) => run_channels_command(&relay_url).await,
            Some(Command::Exec {
                channel,
                action,
                args,
                timeout,
            }) => run_exec_command(&relay_url, &channel, &action, args.as_deref(), timeout).await,
            Some(Command::Tab {
                transport,
                channel_id,
                name,
            }) => run_tab_command(&relay_url, transport, channel_id, &name).await,
            None | Some(Command::Serve { .. }) => Ok(()),
        };
    }

    let log_broadcaster = Arc::new(LogBroadcaster::new());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("obr_relay=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(RelayLogLayer::new(Arc::clone(&log_broadcaster)))
        .init();

    let mut server = config.server.clone();
    if let Some(Command::Serve { host, port }) = &cli.command {
        if let Some(host) = host {
            server.host = *host;
        }
        if let Some(port) = port {
            server.port = *port;
        }
    }

    let observer = create_observer(&config.observability);
    tracing::info!(backend = observer.name(), "Observability initialized");

    let relay = Relay::new(config.relay.settings(), observer);
    let gateway = RelayGateway::new(
        GatewayConfig {
            addr: server.addr(),
            keepalive: config.relay.keepalive(),
            allowed_origins: config.relay.allowed_origins.clone(),
        },
        Arc::clone(&relay),
    )
    .with_log_broadcaster(log_broadcaster);

    let addr = gateway.start().await?;
    tracing::info!(
        %addr,
        default_timeout_ms = config.relay.default_timeout_ms,
        keepalive_secs = config.relay.keepalive_secs,
        "obr-relay ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    gateway.shutdown().await;
    relay.observer().flush();

    Ok(())
}
