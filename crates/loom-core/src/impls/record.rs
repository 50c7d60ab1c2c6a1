//! Task record: the stored task plus scheduling metadata.

use chrono::{DateTime, Utc};

use crate::domain::{IllegalTransitionError, Task, TaskEvent, TaskLog, TaskState};

/// A task as held by the in-memory store.
///
/// The store keeps ordering by `seq` rather than by id: ULIDs created in the
/// same millisecond are not ordered.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    /// Insertion order.
    pub seq: u64,
    /// Retry backoff: not runnable before this instant.
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task: Task, seq: u64) -> Self {
        Self {
            task,
            seq,
            not_before: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.task.state
    }

    pub fn apply(&mut self, event: TaskEvent) -> Result<TaskState, IllegalTransitionError> {
        let next = self.task.state.apply(event)?;
        self.task.state = next;
        Ok(next)
    }

    /// The open (not yet closed) attempt, if any.
    pub fn open_log(&self) -> Option<&TaskLog> {
        self.task.logs.last().filter(|log| !log.is_closed())
    }

    pub fn log_mut(&mut self, attempt: u32) -> Option<&mut TaskLog> {
        self.task.logs.iter_mut().find(|log| log.attempt == attempt)
    }

    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.task.state == TaskState::Queued
            && self.open_log().is_none()
            && self.not_before.is_none_or(|at| at <= now)
    }
}
