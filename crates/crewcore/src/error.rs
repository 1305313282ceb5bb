use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to the caller of `submit`.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Execution {execution_id} timed out after {timeout:?}")]
    Timeout {
        execution_id: String,
        timeout: Duration,
    },

    #[error("Execution {execution_id} was cancelled")]
    Cancelled { execution_id: String },

    /// The work's own error, re-raised unchanged after bookkeeping.
    #[error(transparent)]
    Work(anyhow::Error),

    #[error("Execution {0} is already running")]
    Duplicate(String),

    #[error("Execution manager is shut down")]
    ShutDown,
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled { .. })
    }

    /// Borrow the work error, if this is one.
    pub fn as_work(&self) -> Option<&anyhow::Error> {
        match self {
            ExecutionError::Work(e) => Some(e),
            _ => None,
        }
    }
}
