//! Wire protocol shared by every relay transport.
//!
//! All realizations (SSE, WebSocket, broadcast bus) exchange the same JSON
//! envelope, discriminated by its `type` field. Several legacy type names are
//! accepted on input; output always uses the canonical names.
//!
//! ```text
//! caller ──OBR_REQUEST{action,args,requestId}──► channel
//! caller ◄──OBR_RESPONSE{requestId,success,..}── channel
//!            {"type":"ping"} keep-alives both ways, never dispatched
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Free-form channel metadata (player name, room id, user agent, ...).
pub type Metadata = serde_json::Map<String, Value>;

const ID_SUFFIX_LEN: usize = 9;

/// Build an id of the form `{prefix}_{unix_millis}_{9 random chars}`.
///
/// The timestamp separates ids across time and the random suffix separates
/// ids minted in the same millisecond. Callers that need hard uniqueness
/// still check against their own table.
fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id.
            pub fn generate() -> Self {
                Self(generate_id($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque identifier of one addressable channel (usually a browser tab).
    ChannelId,
    "tab"
);

string_id!(
    /// Correlation token pairing a request with its response.
    RequestId,
    "req"
);

/// Action arguments.
///
/// Senders may pass a list, a single value, or nothing at all. A list is
/// taken as-is, `null` or a missing field becomes an empty list, and any
/// other value becomes a one-element list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Args(pub Vec<Value>);

impl Args {
    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Value> for Args {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self(Vec::new()),
            Value::Array(items) => Self(items),
            other => Self(vec![other]),
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(items: Vec<Value>) -> Self {
        Self(items)
    }
}

impl<'de> Deserialize<'de> for Args {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?
            .map(Args::from)
            .unwrap_or_default())
    }
}

/// A single requested action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub action: String,
    #[serde(default)]
    pub args: Args,
    pub request_id: RequestId,
    /// Absent means "the channel that owns this connection".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_channel_id: Option<ChannelId>,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Invocation {
    pub fn new(action: impl Into<String>, args: impl Into<Args>) -> Self {
        Self {
            action: action.into(),
            args: args.into(),
            request_id: RequestId::generate(),
            target_channel_id: None,
            from_channel_id: None,
            timeout: None,
        }
    }

    pub fn with_target(mut self, target: ChannelId) -> Self {
        self.target_channel_id = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

/// Reply to an [`Invocation`], tagged with its request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Valid action names, present when the requested action was unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_actions: Option<Vec<String>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ActionResponse {
    pub fn success(request_id: RequestId, data: Value) -> Self {
        Self {
            request_id,
            success: true,
            data: Some(data),
            error: None,
            available_actions: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(error.into()),
            available_actions: None,
            timestamp: Utc::now(),
        }
    }

    pub fn not_found(request_id: RequestId, action: &str, available: Vec<String>) -> Self {
        Self {
            available_actions: Some(available),
            ..Self::failure(request_id, format!("Action '{}' not found", action))
        }
    }

    /// Convert into the caller-facing outcome of a call to `action`.
    ///
    /// Success payloads pass through unmodified; a missing payload is `null`.
    pub fn into_outcome(self, action: &str) -> Result<Value, RelayError> {
        if self.success {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        match self.available_actions {
            Some(available) => Err(RelayError::ActionNotFound {
                action: action.to_string(),
                available,
            }),
            None => Err(RelayError::ActionFailed(
                self.error.unwrap_or_else(|| "Action failed".to_string()),
            )),
        }
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Which transport a channel is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sse,
    #[serde(rename = "websocket")]
    WebSocket,
    Bus,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
            Self::Bus => "bus",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one channel, as returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: ChannelId,
    #[serde(default)]
    pub metadata: Metadata,
    pub is_online: bool,
    pub state: ChannelState,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
}

/// Every message that crosses a relay transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(
        rename = "OBR_REQUEST",
        alias = "EXECUTE_OBR_ACTION",
        alias = "OBR_ACTION_REQUEST"
    )]
    Request(Invocation),

    #[serde(
        rename = "OBR_RESPONSE",
        alias = "OBR_ACTION_RESPONSE",
        alias = "EXTERNAL_SERVICE_RESPONSE"
    )]
    Response(ActionResponse),

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "REGISTER_CLIENT")]
    RegisterClient {
        #[serde(default)]
        metadata: Metadata,
    },

    #[serde(rename = "CLIENT_REGISTERED", rename_all = "camelCase")]
    ClientRegistered { channel_id: ChannelId, success: bool },

    #[serde(rename = "UPDATE_METADATA")]
    UpdateMetadata {
        #[serde(default)]
        metadata: Metadata,
    },

    #[serde(rename = "LIST_CLIENTS", rename_all = "camelCase")]
    ListClients {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },

    #[serde(rename = "CLIENTS_LIST", rename_all = "camelCase")]
    ClientsList {
        clients: Vec<ChannelSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

impl Envelope {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "OBR_REQUEST",
            Self::Response(_) => "OBR_RESPONSE",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::RegisterClient { .. } => "REGISTER_CLIENT",
            Self::ClientRegistered { .. } => "CLIENT_REGISTERED",
            Self::UpdateMetadata { .. } => "UPDATE_METADATA",
            Self::ListClients { .. } => "LIST_CLIENTS",
            Self::ClientsList { .. } => "CLIENTS_LIST",
        }
    }
}

/// Shallow, additive merge: keys in `partial` overwrite, other keys stay.
pub fn merge_metadata(target: &mut Metadata, partial: Metadata) {
    for (key, value) in partial {
        target.insert(key, value);
    }
}
