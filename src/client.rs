//! HTTP client for external callers of the relay.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ClientError, RelayError};
use crate::gateway::types::{
    ChannelListResponse, ExecuteRequest, ExecuteResponse, HealthResponse, TabListResponse,
};
use crate::protocol::{Args, ChannelId, ChannelSummary};

/// Talks to a running relay on behalf of an agent or script.
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a GET request, check the status, and deserialize the JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        context: &str,
    ) -> Result<T, ClientError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ClientError::ConnectionFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                context: context.to_string(),
                status: status.as_u16(),
                reason: body,
            });
        }

        resp.json().await.map_err(|e| ClientError::InvalidResponse {
            reason: format!("{}: {}", context, e),
        })
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get_json("api/health", "GET /api/health").await
    }

    /// Channels currently known to the relay.
    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>, ClientError> {
        let resp: ChannelListResponse = self.get_json("channels", "GET /channels").await?;
        Ok(resp.channels)
    }

    pub async fn list_tabs(&self) -> Result<Vec<ChannelId>, ClientError> {
        let resp: TabListResponse = self.get_json("tabs", "GET /tabs").await?;
        Ok(resp.tabs)
    }

    /// Invoke `action` on `channel` and wait for its result.
    ///
    /// Failures the relay can classify come back as [`ClientError::Relay`];
    /// timeouts and anything unexpected as [`ClientError::Rejected`].
    pub async fn execute(
        &self,
        channel: &ChannelId,
        action: &str,
        args: impl Into<Args>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let body = ExecuteRequest {
            action: action.to_string(),
            args: args.into(),
            timeout: timeout.map(|t| t.as_millis() as u64),
        };
        let path = format!("execute/{}", channel);
        let resp = self.post(&path, &body).await?;

        let status = resp.status();
        let reply: ExecuteResponse =
            resp.json().await.map_err(|e| ClientError::InvalidResponse {
                reason: format!("POST /{}: {}", path, e),
            })?;

        if reply.success {
            return Ok(reply.result.unwrap_or(Value::Null));
        }
        Err(execute_error(channel, action, status, reply))
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, ClientError> {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::ConnectionFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })
    }
}

fn execute_error(
    channel: &ChannelId,
    action: &str,
    status: StatusCode,
    reply: ExecuteResponse,
) -> ClientError {
    let message = reply.error.unwrap_or_else(|| "Action failed".to_string());
    let relay_error = match status {
        StatusCode::NOT_FOUND => Some(RelayError::ChannelNotFound {
            channel: channel.clone(),
        }),
        StatusCode::UNPROCESSABLE_ENTITY => Some(match reply.available_actions {
            Some(available) => RelayError::ActionNotFound {
                action: action.to_string(),
                available,
            },
            None => RelayError::ActionFailed(message.clone()),
        }),
        StatusCode::BAD_GATEWAY => Some(RelayError::ChannelClosed {
            channel: channel.clone(),
        }),
        _ => None,
    };

    match relay_error {
        Some(e) => ClientError::Relay(e),
        None => ClientError::Rejected {
            context: format!("execute {} on {}", action, channel),
            status: status.as_u16(),
            reason: message,
        },
    }
}
