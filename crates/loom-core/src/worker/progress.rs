//! Attempt progress: what a worker tells whoever is watching it.
//!
//! In-process workers share a snapshot through memory; remote (batch) workers
//! write it to a JSON file that the submitting adapter reads back.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{AttemptReport, ExecutorLog, TaskState};

/// Where a running attempt is, before it has a final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Submitted, worker not started yet.
    #[default]
    Pending,
    Initializing,
    Running,
}

/// An adapter's view of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptSnapshot {
    pub phase: Phase,
    #[serde(default)]
    pub executor_logs: Vec<ExecutorLog>,
    /// Present once the attempt has ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<AttemptReport>,
}

impl AttemptSnapshot {
    pub fn finished(report: AttemptReport) -> Self {
        Self {
            phase: Phase::Running,
            executor_logs: report.executor_logs.clone(),
            report: Some(report),
        }
    }

    /// The task state this snapshot implies.
    pub fn state(&self) -> TaskState {
        match (&self.report, self.phase) {
            (Some(report), _) => report.outcome.state(),
            (None, Phase::Pending | Phase::Initializing) => TaskState::Initializing,
            (None, Phase::Running) => TaskState::Running,
        }
    }

    fn upsert_log(&mut self, log: ExecutorLog) {
        match self.executor_logs.iter_mut().find(|l| l.index == log.index) {
            Some(existing) => *existing = log,
            None => self.executor_logs.push(log),
        }
    }
}

/// Sink for worker progress.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn phase(&self, phase: Phase);

    /// Insert or replace the log of one executor (matched by index).
    async fn executor_log(&self, log: ExecutorLog);

    async fn finished(&self, report: &AttemptReport);
}

/// Snapshot shared in memory between a worker and its adapter.
#[derive(Debug, Clone, Default)]
pub struct SharedProgress {
    inner: Arc<Mutex<AttemptSnapshot>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AttemptSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AttemptSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProgressReporter for SharedProgress {
    async fn phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    async fn executor_log(&self, log: ExecutorLog) {
        self.lock().upsert_log(log);
    }

    async fn finished(&self, report: &AttemptReport) {
        *self.lock() = AttemptSnapshot::finished(report.clone());
    }
}

/// Snapshot persisted as JSON, rewritten atomically on every update.
pub struct FileProgress {
    path: PathBuf,
    snapshot: tokio::sync::Mutex<AttemptSnapshot>,
}

impl FileProgress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: tokio::sync::Mutex::new(AttemptSnapshot::default()),
        }
    }

    /// Read a snapshot written by a (possibly remote) worker.
    ///
    /// `Ok(None)` means the worker has not written anything yet.
    pub async fn read(path: &Path) -> std::io::Result<Option<AttemptSnapshot>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(std::io::Error::other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, snapshot: &AttemptSnapshot) {
        if let Err(err) = self.try_write(snapshot).await {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write progress file");
        }
    }

    async fn try_write(&self, snapshot: &AttemptSnapshot) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

#[async_trait]
impl ProgressReporter for FileProgress {
    async fn phase(&self, phase: Phase) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.phase = phase;
        self.write(&snapshot).await;
    }

    async fn executor_log(&self, log: ExecutorLog) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.upsert_log(log);
        self.write(&snapshot).await;
    }

    async fn finished(&self, report: &AttemptReport) {
        let mut snapshot = self.snapshot.lock().await;
        *snapshot = AttemptSnapshot::finished(report.clone());
        self.write(&snapshot).await;
    }
}
