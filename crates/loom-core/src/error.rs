use thiserror::Error;

use crate::domain::{IllegalTransitionError, TaskId, ValidationError};
use crate::ports::StoreError;

/// Errors returned by the task service and the scheduler handle.
#[derive(Debug, Error)]
pub enum LoomError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid task: {0}")]
    Validation(ValidationError),

    #[error("unsupported storage url {url:?}")]
    UnsupportedStorage { url: String },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error(transparent)]
    Store(StoreError),

    #[error("scheduler is not running")]
    SchedulerUnavailable,
}

impl From<ValidationError> for LoomError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::UnsupportedStorage { url, .. } => LoomError::UnsupportedStorage { url },
            other => LoomError::Validation(other),
        }
    }
}

impl From<StoreError> for LoomError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LoomError::NotFound(id),
            StoreError::IllegalTransition(err) => LoomError::IllegalTransition(err),
            other => LoomError::Store(other),
        }
    }
}
