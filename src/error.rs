//! Error types for the relay.

use crate::protocol::{ChannelId, RequestId};

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Channel registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {id} not found")]
    NotFound { id: ChannelId },

    #[error("Channel id {id} is already in use")]
    IdTaken { id: ChannelId },

    #[error("Channel {id} is closed")]
    Closed { id: ChannelId },
}

/// Outcome of a relayed call that did not produce a result.
///
/// The `Display` text is what callers see, so keep it human-readable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Channel {channel} not found")]
    ChannelNotFound { channel: ChannelId },

    #[error("Action '{action}' not found")]
    ActionNotFound {
        action: String,
        available: Vec<String>,
    },

    #[error("Request {request_id} for action '{action}' timed out after {timeout_ms}ms")]
    Timeout {
        request_id: RequestId,
        action: String,
        timeout_ms: u64,
    },

    #[error("Channel {channel} closed before responding")]
    ChannelClosed { channel: ChannelId },

    #[error("{0}")]
    ActionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Short machine-friendly kind, used in logs and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelNotFound { .. } => "channel_not_found",
            Self::ActionNotFound { .. } => "action_not_found",
            Self::Timeout { .. } => "timeout",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::ActionFailed(_) => "action_failed",
            Self::Transport(_) => "transport",
        }
    }
}

/// Gateway startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Relay server failed to start: {reason}")]
    StartupFailed { reason: String },
}

/// Errors from the tab-side and caller-side clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Relay rejected {context}: {status} {reason}")]
    Rejected {
        context: String,
        status: u16,
        reason: String,
    },

    #[error("Invalid response from relay: {reason}")]
    InvalidResponse { reason: String },

    #[error("Relay registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error(transparent)]
    Relay(#[from] RelayError),
}
