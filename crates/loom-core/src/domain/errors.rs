//! Domain errors: spec validation and state machine violations.

use thiserror::Error;

use super::state::{TaskEvent, TaskState};

/// A task spec was rejected before any state was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task must declare at least one executor")]
    NoExecutors,

    #[error("executor {index} has an empty command")]
    EmptyCommand { index: usize },

    #[error("{kind} {index}: path must be absolute, got {path:?}")]
    RelativePath {
        kind: &'static str,
        index: usize,
        path: String,
    },

    #[error("input {index}: exactly one of url or content must be set")]
    InputSource { index: usize },

    #[error("input {index}: inline content is only allowed for FILE inputs")]
    ContentDirectory { index: usize },

    #[error("output {index}: url must not be empty")]
    EmptyOutputUrl { index: usize },

    #[error("{kind} {index}: no storage backend supports url {url:?}")]
    UnsupportedStorage {
        kind: &'static str,
        index: usize,
        url: String,
    },
}

/// The requested edge is not in the transition table.
///
/// Should never happen in correct operation; callers log it and abort only
/// the offending attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition: {event:?} from {from}")]
pub struct IllegalTransitionError {
    pub from: TaskState,
    pub event: TaskEvent,
}
