//! Assignment: one attempt of a task handed to a compute backend.

use serde::{Deserialize, Serialize};

use super::ids::AssignmentId;
use super::task::Task;

/// Everything a worker needs to run one attempt, wherever it runs.
///
/// Batch backends write this to disk as JSON for the remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub attempt: u32,
    pub task: Task,
}

impl Assignment {
    pub fn new(id: AssignmentId, task: Task, attempt: u32) -> Self {
        Self { id, attempt, task }
    }
}
