//! Decision model: what happens to a task after an attempt ends.

use std::time::Duration;

use serde::Serialize;

use super::retry::RetryPolicy;
use crate::domain::{AttemptOutcome, Resources, Task, TaskId};

/// The next action for a task whose attempt just ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Re-queue after `delay`.
    Retry { delay: Duration, reason: String },

    /// Leave the task in its failed state.
    GiveUp { reason: String },

    /// Nothing to do; the outcome is final.
    Done,
}

/// Decides the next action from a task and the outcome of its latest attempt.
///
/// Deciders are pure: the scheduler carries out the decision.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &Task, outcome: AttemptOutcome) -> Decision;
}

/// Retries SYSTEM_ERROR attempts with exponential backoff until
/// `max_attempts` attempts exist. Executor failures are never retried.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry_policy,
            max_attempts,
        }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), 3)
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &Task, outcome: AttemptOutcome) -> Decision {
        if outcome != AttemptOutcome::SystemError {
            return Decision::Done;
        }
        let attempts = task.attempts();
        if attempts >= self.max_attempts {
            Decision::GiveUp {
                reason: format!("retry limit reached: {attempts}/{}", self.max_attempts),
            }
        } else {
            let delay = self.retry_policy.next_delay(attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "retrying as attempt {}/{} after {:?}",
                    attempts + 1,
                    self.max_attempts,
                    delay
                ),
            }
        }
    }
}

/// One entry of a scheduler's decision history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionRecord {
    Assigned {
        task_id: TaskId,
        attempt: u32,
        adapter: String,
        request: Resources,
        /// Adapter free capacity just before the reservation.
        free_before: Resources,
    },
    Released {
        task_id: TaskId,
        attempt: u32,
        adapter: String,
        outcome: AttemptOutcome,
    },
    Retried {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    GaveUp {
        task_id: TaskId,
        attempt: u32,
    },
    Canceled {
        task_id: TaskId,
        attempt: u32,
    },
}
