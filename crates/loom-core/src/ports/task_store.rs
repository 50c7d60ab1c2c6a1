//! TaskStore port: the source of truth for tasks, their state and attempts.
//!
//! Every mutation of a single task happens under the store's lock, so
//! transitions on one task are totally ordered. Assignment bookkeeping
//! (`begin_attempt`/`finish_attempt`) is atomic with the state change it
//! implies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    AttemptReport, ExecutorLog, IllegalTransitionError, Task, TaskEvent, TaskId, TaskState,
    TaskView,
};
use crate::observability::TaskCounts;

pub const DEFAULT_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error("task {0} already has an attempt in flight")]
    AttemptInFlight(TaskId),

    #[error("task {task_id} has no attempt {attempt}")]
    UnknownAttempt { task_id: TaskId, attempt: u32 },

    #[error("attempt {attempt} of task {task_id} is already closed")]
    AttemptClosed { task_id: TaskId, attempt: u32 },
}

/// Result of a cancel request that did not need an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was QUEUED with no attempt in flight and is now CANCELED.
    Canceled,
    /// Nothing to do.
    AlreadyTerminal(TaskState),
    /// An attempt is in flight; the owning adapter must be told.
    Assigned { attempt: u32 },
}

/// Filters and paging for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub state: Option<TaskState>,
    pub name_prefix: Option<String>,
    /// Defaults to `DEFAULT_PAGE_SIZE`, capped at `MAX_PAGE_SIZE`.
    pub page_size: Option<usize>,
    /// The last id of the previous page.
    pub page_token: Option<TaskId>,
    pub view: TaskView,
}

impl ListQuery {
    pub fn effective_page_size(&self) -> usize {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.state.is_some_and(|state| state != task.state) {
            return false;
        }
        match &self.name_prefix {
            Some(prefix) => task
                .spec
                .name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub tasks: Vec<Task>,
    /// Present when more tasks may follow.
    pub next_page_token: Option<TaskId>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Tasks in creation order.
    async fn list(&self, query: &ListQuery) -> Result<ListPage, StoreError>;

    /// QUEUED tasks whose retry backoff has elapsed, in creation order.
    async fn runnable(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Apply one event and return the new state.
    async fn transition(&self, id: TaskId, event: TaskEvent) -> Result<TaskState, StoreError>;

    /// Open a new TaskLog and move the task to INITIALIZING.
    ///
    /// Fails with `AttemptInFlight` if the previous attempt is still open.
    /// Returns the new attempt number.
    async fn begin_attempt(
        &self,
        id: TaskId,
        adapter: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Replace the executor logs of an open attempt.
    async fn record_progress(
        &self,
        id: TaskId,
        attempt: u32,
        logs: Vec<ExecutorLog>,
    ) -> Result<(), StoreError>;

    /// Close an open attempt and move the task to the outcome's state.
    ///
    /// Nothing is written if the implied transitions are illegal.
    async fn finish_attempt(
        &self,
        id: TaskId,
        attempt: u32,
        report: AttemptReport,
    ) -> Result<TaskState, StoreError>;

    /// Hold the task back from `runnable` until `at`.
    async fn set_not_before(&self, id: TaskId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Append a note to the given attempt's system logs.
    async fn append_system_log(
        &self,
        id: TaskId,
        attempt: u32,
        message: String,
    ) -> Result<(), StoreError>;

    /// Cancel without an adapter round trip when possible.
    async fn cancel_if_unassigned(&self, id: TaskId) -> Result<CancelOutcome, StoreError>;

    async fn counts_by_state(&self) -> Result<TaskCounts, StoreError>;
}
