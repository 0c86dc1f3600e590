//! Polling of asynchronous server operations.

use crate::cancellation::CancellationToken;
use crate::error::{ClientError, ClientResult};
use crate::executor::RequestExecutor;
use docstore_protocol::{OperationState, OperationStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Handle on a server operation that completes asynchronously.
pub struct Operation {
    executor: Arc<dyn RequestExecutor>,
    id: i64,
    poll_interval: Duration,
}

impl Operation {
    /// Creates a handle for operation `id`.
    pub fn new(executor: Arc<dyn RequestExecutor>, id: i64) -> Self {
        Self {
            executor,
            id,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Sets the delay between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Returns the operation id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Fetches the current state once.
    pub fn fetch_state(&self) -> ClientResult<OperationState> {
        self.executor.get_operation_state(self.id)
    }

    /// Polls until the operation reaches a terminal state.
    ///
    /// Returns the result payload on completion (`Value::Null` if none).
    pub fn wait_for_completion(&self, token: &CancellationToken) -> ClientResult<Value> {
        loop {
            token.check_cancelled()?;
            let state = self.fetch_state()?;
            trace!(operation = self.id, status = ?state.status, "polled operation");
            match state.status {
                OperationStatus::Completed => return Ok(state.result.unwrap_or(Value::Null)),
                OperationStatus::Cancelled => return Err(ClientError::Cancelled),
                OperationStatus::Faulted => {
                    return Err(ClientError::OperationFaulted {
                        id: self.id,
                        message: state.failure_message(),
                    })
                }
                OperationStatus::InProgress => std::thread::sleep(self.poll_interval),
            }
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
