//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;
use crate::protocol::{ActionResponse, Args, ChannelId, ChannelSummary, Metadata, RequestId};

/// `POST /execute/{channel}` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub action: String,
    #[serde(default)]
    pub args: Args,
    /// Milliseconds; the relay default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `POST /execute/{channel}` reply.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error class, e.g. `timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_actions: Option<Vec<String>>,
}

impl ExecuteResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            kind: None,
            available_actions: None,
        }
    }

    pub fn err(error: &RelayError) -> Self {
        let available_actions = match error {
            RelayError::ActionNotFound { available, .. } => Some(available.clone()),
            _ => None,
        };
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            kind: Some(error.kind().to_string()),
            available_actions,
        }
    }
}

/// `POST /response/{channel}` body, as posted by a tab.
///
/// `result` and `data` are both accepted for the payload. `success`
/// defaults to "no error given".
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSubmission {
    pub request_id: RequestId,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub available_actions: Option<Vec<String>>,
}

impl ResponseSubmission {
    pub fn into_response(self) -> ActionResponse {
        let success = self.success.unwrap_or(self.error.is_none());
        let data = self.result.or(self.data);
        let mut response = if success {
            ActionResponse::success(self.request_id, data.unwrap_or(Value::Null))
        } else {
            ActionResponse::failure(
                self.request_id,
                self.error.unwrap_or_else(|| "Action failed".to_string()),
            )
        };
        response.available_actions = self.available_actions;
        response
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TabListResponse {
    pub tabs: Vec<ChannelId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub channel_id: ChannelId,
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub channels: usize,
    pub sse_connections: u64,
    pub ws_connections: u64,
    pub pending_requests: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn submission_with_result_is_success() {
        let sub: ResponseSubmission =
            serde_json::from_value(json!({"requestId": "r1", "result": "hi"})).unwrap();
        let resp = sub.into_response();
        assert!(resp.success);
        assert_eq!(resp.data, Some(json!("hi")));
    }

    #[test]
    fn submission_with_error_is_failure() {
        let sub: ResponseSubmission = serde_json::from_value(json!({
            "requestId": "r1",
            "error": "Action 'x' not found",
            "availableActions": ["echo"]
        }))
        .unwrap();
        let resp = sub.into_response();
        assert!(!resp.success);
        assert_eq!(resp.available_actions, Some(vec!["echo".to_string()]));
    }

    #[test]
    fn execute_error_body_carries_available_actions() {
        let body = ExecuteResponse::err(&RelayError::ActionNotFound {
            action: "x".into(),
            available: vec!["echo".into()],
        });
        let value = serde_json::to_value(body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Action 'x' not found");
        assert_eq!(value["availableActions"], json!(["echo"]));
        assert!(value.get("result").is_none());
    }
}
