//! Channel-side action execution.
//!
//! A channel receives [`Invocation`]s and must answer each with exactly one
//! [`ActionResponse`]. Action names are validated against a closed
//! [`ActionSet`] at the boundary, so executors only ever see typed actions.

pub mod tabletop;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::protocol::{ActionResponse, Invocation};

pub use self::tabletop::{TabletopAction, TabletopExecutor};

/// A closed set of named actions.
pub trait ActionSet: Sized + Copy + Send + Sync + 'static {
    /// Every variant, in listing order.
    const ALL: &'static [Self];

    /// Wire name of the action.
    fn name(self) -> &'static str;

    /// Validated lookup by wire name.
    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|action| action.name() == name)
    }

    /// All valid wire names.
    fn names() -> Vec<String> {
        Self::ALL.iter().map(|action| action.name().to_string()).collect()
    }
}

/// Performs actions inside a channel.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    type Action: ActionSet;

    /// Run one action. Errors are reported to the caller as
    /// `{success:false, error}`.
    async fn execute(&self, action: Self::Action, args: Vec<Value>) -> Result<Value, String>;
}

/// Turns invocations into replies using an [`ActionExecutor`].
pub struct ActionDispatcher<E: ActionExecutor> {
    executor: Arc<E>,
}

impl<E: ActionExecutor> Clone for ActionDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<E: ActionExecutor> ActionDispatcher<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Execute `invocation` and build its reply.
    ///
    /// Always returns exactly one response carrying the invocation's
    /// request id, including when the action is unknown, fails, or panics.
    pub async fn dispatch(&self, invocation: Invocation) -> ActionResponse {
        let Invocation {
            action,
            args,
            request_id,
            ..
        } = invocation;

        let Some(typed) = E::Action::from_name(&action) else {
            tracing::debug!(action = %action, "Unknown action requested");
            return ActionResponse::not_found(request_id, &action, E::Action::names());
        };

        let run = self.executor.execute(typed, args.into_vec());
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(data)) => ActionResponse::success(request_id, data),
            Ok(Err(message)) => {
                tracing::debug!(action = %action, error = %message, "Action failed");
                ActionResponse::failure(request_id, message)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "action panicked".to_string());
                tracing::error!(action = %action, error = %message, "Action panicked");
                ActionResponse::failure(request_id, message)
            }
        }
    }
}
