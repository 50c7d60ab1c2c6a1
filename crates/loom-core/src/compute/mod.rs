//! Compute backend adapters: where attempts actually run.
//!
//! The scheduler talks to every backend through [`ComputeBackend`] and never
//! branches on the concrete kind. Backends are poll-based: `submit` returns a
//! handle, `poll` returns the latest [`AttemptSnapshot`], `cancel` stops the
//! attempt and returns once it is gone.

mod batch;
mod worker_adapter;

pub use batch::{BatchAdapter, BatchSettings, BatchSystem, JobStatus};
pub use worker_adapter::WorkerAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Assignment, AssignmentId, Resources};
use crate::worker::AttemptSnapshot;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("compute backend unavailable: {0}")]
    Unavailable(String),

    #[error("unknown handle for assignment {0}")]
    UnknownHandle(AssignmentId),

    #[error("{command} failed: {message}")]
    Command { command: String, message: String },

    #[error("could not parse {what}: {output:?}")]
    Parse { what: &'static str, output: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Identifies a submitted attempt within its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHandle {
    pub adapter: String,
    pub assignment: AssignmentId,
    /// Backend-specific id (e.g. a batch job id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Total capacity, from configuration.
    fn capacity(&self) -> &Resources;

    async fn submit(&self, assignment: Assignment) -> Result<BackendHandle, AdapterError>;

    async fn poll(&self, handle: &BackendHandle) -> Result<AttemptSnapshot, AdapterError>;

    /// Stop the attempt. Returns once the backend no longer runs it.
    async fn cancel(&self, handle: &BackendHandle) -> Result<(), AdapterError>;
}
