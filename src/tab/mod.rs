//! Channel-side clients: the code a browser tab runs to serve actions.
//!
//! Both clients execute requests through an [`ActionDispatcher`] and send
//! exactly one reply per request. Requests run concurrently.
//!
//! [`ActionDispatcher`]: crate::executor::ActionDispatcher

pub mod sse_client;
pub mod ws_client;

pub use sse_client::SseTabClient;
pub use ws_client::WsTabClient;

use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::protocol::ChannelId;

/// A connected channel running in the background.
pub struct TabHandle {
    channel_id: ChannelId,
    task: JoinHandle<Result<(), ClientError>>,
}

impl TabHandle {
    pub(crate) fn new(channel_id: ChannelId, task: JoinHandle<Result<(), ClientError>>) -> Self {
        Self { channel_id, task }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Drop the connection. The relay notices and unregisters the channel.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Wait until the relay ends the connection.
    pub async fn join(mut self) -> Result<(), ClientError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ClientError::InvalidResponse {
                reason: format!("tab task failed: {}", e),
            }),
        }
    }
}

impl Drop for TabHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
