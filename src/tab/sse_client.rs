//! Tab client for the HTTP+SSE transport.
//!
//! Requests arrive on `GET /channels/{id}`; replies go back with
//! `POST /response/{id}`.

use futures::StreamExt;

use crate::error::ClientError;
use crate::executor::{ActionDispatcher, ActionExecutor};
use crate::protocol::{ActionResponse, ChannelId, Envelope};
use crate::tab::TabHandle;

pub struct SseTabClient<E: ActionExecutor> {
    http: reqwest::Client,
    base_url: String,
    channel_id: ChannelId,
    metadata: Vec<(String, String)>,
    dispatcher: ActionDispatcher<E>,
}

impl<E: ActionExecutor> SseTabClient<E> {
    pub fn new(
        base_url: impl Into<String>,
        channel_id: ChannelId,
        dispatcher: ActionDispatcher<E>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            channel_id,
            metadata: Vec::new(),
            dispatcher,
        }
    }

    /// Metadata sent as query pairs when the stream opens.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }

    /// Open the event stream. The channel is registered once this returns.
    pub async fn connect(self) -> Result<TabHandle, ClientError> {
        let url = format!("{}/channels/{}", self.base_url, self.channel_id);
        let resp = self
            .http
            .get(&url)
            .query(&self.metadata)
            .send()
            .await
            .map_err(|e| ClientError::ConnectionFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Rejected {
                context: format!("GET /channels/{}", self.channel_id),
                status: status.as_u16(),
                reason: body,
            });
        }

        tracing::info!(channel = %self.channel_id, "SSE channel connected");
        let channel_id = self.channel_id.clone();
        let task = tokio::spawn(self.run(resp));
        Ok(TabHandle::new(channel_id, task))
    }

    async fn run(self, resp: reqwest::Response) -> Result<(), ClientError> {
        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::ConnectionFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;
            for data in decoder.push(&chunk) {
                self.handle_event(&data);
            }
        }

        tracing::info!(channel = %self.channel_id, "Relay closed the event stream");
        Ok(())
    }

    fn handle_event(&self, data: &str) {
        let invocation = match Envelope::parse(data) {
            Ok(Envelope::Request(invocation)) => invocation,
            Ok(Envelope::Ping) => return,
            Ok(other) => {
                tracing::debug!(channel = %self.channel_id, kind = other.kind(), "Ignoring event");
                return;
            }
            Err(e) => {
                tracing::warn!(channel = %self.channel_id, error = %e, "Dropping malformed event");
                return;
            }
        };

        let dispatcher = self.dispatcher.clone();
        let http = self.http.clone();
        let url = format!("{}/response/{}", self.base_url, self.channel_id);
        tokio::spawn(async move {
            let response = dispatcher.dispatch(invocation).await;
            post_response(&http, &url, &response).await;
        });
    }
}

async fn post_response(http: &reqwest::Client, url: &str, response: &ActionResponse) {
    match http.post(url).json(response).send().await {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => {
            // Usually the caller already timed out.
            tracing::debug!(
                request_id = %response.request_id,
                status = %resp.status(),
                "Relay did not accept response"
            );
        }
        Err(e) => {
            tracing::warn!(request_id = %response.request_id, error = %e, "Failed to post response");
        }
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Yields the joined `data:` payload of each complete event. Events with no
/// data lines (comments, bare keep-alives) yield nothing.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block[..end]);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}
