//! Attempt history: TaskLog, ExecutorLog and the attempt report a worker
//! produces.
//!
//! A TaskLog records one scheduling attempt. It is opened by the scheduler
//! when the task is assigned, filled with executor logs while the worker runs,
//! and closed exactly once with an outcome and a human-readable reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Complete,
    /// An executor exited nonzero. Never retried automatically.
    ExecutorError,
    /// Staging or adapter failure. Eligible for retry.
    SystemError,
    Canceled,
}

impl AttemptOutcome {
    /// The task state this outcome resolves to.
    pub fn state(self) -> TaskState {
        match self {
            AttemptOutcome::Complete => TaskState::Complete,
            AttemptOutcome::ExecutorError => TaskState::Error,
            AttemptOutcome::SystemError => TaskState::SystemError,
            AttemptOutcome::Canceled => TaskState::Canceled,
        }
    }
}

/// Result of one executor step.
///
/// `end_time` and `exit_code` stay `None` while the step runs, and for a step
/// that was killed before it exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorLog {
    pub index: usize,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// One file uploaded during output staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFileLog {
    pub url: String,
    pub path: String,
    pub size_bytes: u64,
}

/// The record of one scheduling attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Name of the compute backend that ran the attempt.
    pub adapter: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<ExecutorLog>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputFileLog>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_logs: Vec<String>,
}

impl TaskLog {
    pub fn new(attempt: u32, adapter: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            attempt,
            adapter: adapter.into(),
            start_time,
            end_time: None,
            outcome: None,
            reason: None,
            logs: Vec::new(),
            outputs: Vec::new(),
            system_logs: Vec::new(),
        }
    }

    /// Has this attempt reached its terminal outcome?
    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Close the attempt with the worker's report.
    pub fn close(&mut self, report: AttemptReport) {
        self.end_time = Some(report.end_time);
        self.outcome = Some(report.outcome);
        self.reason = report.reason;
        self.logs = report.executor_logs;
        self.outputs = report.outputs;
    }
}

/// What a worker hands back when an attempt ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub executor_logs: Vec<ExecutorLog>,
    #[serde(default)]
    pub outputs: Vec<OutputFileLog>,
    pub end_time: DateTime<Utc>,
}

impl AttemptReport {
    pub fn complete(end_time: DateTime<Utc>) -> Self {
        Self::new(AttemptOutcome::Complete, None, end_time)
    }

    pub fn executor_error(reason: impl Into<String>, end_time: DateTime<Utc>) -> Self {
        Self::new(AttemptOutcome::ExecutorError, Some(reason.into()), end_time)
    }

    pub fn system_error(reason: impl Into<String>, end_time: DateTime<Utc>) -> Self {
        Self::new(AttemptOutcome::SystemError, Some(reason.into()), end_time)
    }

    pub fn canceled(end_time: DateTime<Utc>) -> Self {
        Self::new(
            AttemptOutcome::Canceled,
            Some("canceled".to_string()),
            end_time,
        )
    }

    fn new(outcome: AttemptOutcome, reason: Option<String>, end_time: DateTime<Utc>) -> Self {
        Self {
            outcome,
            reason,
            executor_logs: Vec::new(),
            outputs: Vec::new(),
            end_time,
        }
    }

    pub fn with_executor_logs(mut self, logs: Vec<ExecutorLog>) -> Self {
        self.executor_logs = logs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputFileLog>) -> Self {
        self.outputs = outputs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_as_required_names() {
        let s = serde_json::to_string(&AttemptOutcome::ExecutorError).unwrap();
        assert_eq!(s, "\"EXECUTOR_ERROR\"");
        assert_eq!(AttemptOutcome::SystemError.state(), TaskState::SystemError);
    }

    #[test]
    fn close_copies_the_report() {
        let now = Utc::now();
        let mut log = TaskLog::new(1, "local", now);
        assert!(!log.is_closed());

        let report = AttemptReport::system_error("input staging failed", now);
        log.close(report);

        assert!(log.is_closed());
        assert_eq!(log.outcome, Some(AttemptOutcome::SystemError));
        assert_eq!(log.reason.as_deref(), Some("input staging failed"));
        assert_eq!(log.end_time, Some(now));
    }
}
