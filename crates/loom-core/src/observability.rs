//! Read-only status views.

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub queued: usize,
    pub initializing: usize,
    pub running: usize,
    pub complete: usize,
    pub error: usize,
    pub system_error: usize,
    pub canceled: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Initializing => self.initializing += 1,
            TaskState::Running => self.running += 1,
            TaskState::Complete => self.complete += 1,
            TaskState::Error => self.error += 1,
            TaskState::SystemError => self.system_error += 1,
            TaskState::Canceled => self.canceled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued
            + self.initializing
            + self.running
            + self.complete
            + self.error
            + self.system_error
            + self.canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_counts_each_state() {
        let mut counts = TaskCounts::default();
        for state in TaskState::ALL {
            counts.add(state);
        }
        counts.add(TaskState::Queued);
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.canceled, 1);
        assert_eq!(counts.total(), 8);
    }
}
