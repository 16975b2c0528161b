use async_trait::async_trait;
use thiserror::Error;

use super::queue::TaskRequest;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed, may succeed later: {0}")]
    Retryable(String),

    #[error("Task failed permanently: {0}")]
    Permanent(String),

    #[error("Task handler timed out")]
    Timeout,
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_) | TaskError::Timeout)
    }
}

/// Executes one kind of task pulled from the work queue
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The `TaskRequest::kind` this handler accepts
    fn task_kind(&self) -> &'static str;

    async fn handle(&self, task: &TaskRequest) -> Result<(), TaskError>;
}
