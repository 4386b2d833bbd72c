//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the relay (`serve`)
//! - Running an in-memory tabletop channel (`tab`)
//! - Inspecting and calling channels (`channels`, `exec`)

mod channels;
mod exec;
mod tab;

pub use channels::run_channels_command;
pub use exec::run_exec_command;
pub use tab::run_tab_command;

use std::net::IpAddr;

use clap::{Parser, Subcommand};

use crate::config::TransportChoice;

#[derive(Parser, Debug)]
#[command(name = "obr-relay")]
#[command(about = "Relay that lets external agents invoke Owlbear Rodeo actions inside a browser tab")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Relay base URL for client commands (overrides RELAY_URL)
    #[arg(long, global = true)]
    pub relay_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server (default if no subcommand given)
    Serve {
        /// Bind host (overrides SERVER_HOST)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Bind port (overrides SERVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Serve tabletop actions from an in-memory scene, like a tab would
    Tab {
        /// Transport used to reach the relay: sse or ws
        #[arg(long, default_value = "sse")]
        transport: TransportChoice,

        /// Channel id to claim (SSE only; generated when absent)
        #[arg(long)]
        channel_id: Option<String>,

        /// Player name reported by the scene
        #[arg(long, default_value = "Relay Tab")]
        name: String,
    },

    /// List connected channels
    Channels,

    /// Invoke an action on a channel and print the result
    Exec {
        /// Target channel id
        channel: String,

        /// Action name, e.g. getItems
        action: String,

        /// Arguments as JSON; a non-array value is passed as the only argument
        args: Option<String>,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

impl Cli {
    /// Check if we should run the server (default behavior or explicit `serve` command).
    pub fn should_serve(&self) -> bool {
        matches!(self.command, None | Some(Command::Serve { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_serves() {
        let cli = Cli::try_parse_from(["obr-relay"]).unwrap();
        assert!(cli.should_serve());
    }

    #[test]
    fn exec_parses_positionals() {
        let cli = Cli::try_parse_from([
            "obr-relay",
            "exec",
            "tab_1",
            "echo",
            "[\"hi\"]",
            "--timeout",
            "500",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Exec {
                channel,
                action,
                args,
                timeout,
            }) => {
                assert_eq!(channel, "tab_1");
                assert_eq!(action, "echo");
                assert_eq!(args.as_deref(), Some("[\"hi\"]"));
                assert_eq!(timeout, Some(500));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn tab_transport_is_parsed() {
        let cli = Cli::try_parse_from(["obr-relay", "tab", "--transport", "ws"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Tab {
                transport: TransportChoice::WebSocket,
                ..
            })
        ));
        assert!(Cli::try_parse_from(["obr-relay", "tab", "--transport", "smoke"]).is_err());
    }
}
