//! In-process adapter: each attempt runs a [`Worker`] on a tokio task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, BackendHandle, ComputeBackend};
use crate::domain::{Assignment, AssignmentId, AttemptReport, Resources};
use crate::ports::Clock;
use crate::storage::StorageRegistry;
use crate::worker::{
    AttemptSnapshot, ContainerRunner, ExecutorRunner, ProcessRunner, SharedProgress, Worker,
    WorkerSettings,
};

struct RunningAttempt {
    progress: SharedProgress,
    cancel: CancellationToken,
    join: JoinHandle<AttemptReport>,
}

/// Runs attempts inside this process, with executors launched either as host
/// processes or as containers.
pub struct WorkerAdapter {
    name: String,
    capacity: Resources,
    worker: Arc<Worker>,
    clock: Arc<dyn Clock>,
    attempts: Mutex<HashMap<AssignmentId, RunningAttempt>>,
}

impl WorkerAdapter {
    pub fn new(
        name: impl Into<String>,
        capacity: Resources,
        storage: Arc<StorageRegistry>,
        runner: Arc<dyn ExecutorRunner>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        let worker = Worker::new(storage, runner, Arc::clone(&clock), settings);
        Self {
            name: name.into(),
            capacity,
            worker: Arc::new(worker),
            clock,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Executors run as host processes.
    pub fn local(
        name: impl Into<String>,
        capacity: Resources,
        storage: Arc<StorageRegistry>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self::new(name, capacity, storage, Arc::new(ProcessRunner), clock, settings)
    }

    /// Executors run in containers through `settings.container_binary`.
    pub fn container(
        name: impl Into<String>,
        capacity: Resources,
        storage: Arc<StorageRegistry>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        let runner = Arc::new(ContainerRunner::new(settings.container_binary.clone()));
        Self::new(name, capacity, storage, runner, clock, settings)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AssignmentId, RunningAttempt>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, id: AssignmentId) -> Result<RunningAttempt, AdapterError> {
        self.lock().remove(&id).ok_or(AdapterError::UnknownHandle(id))
    }

    /// The worker task ended without a report: it panicked or was aborted.
    async fn reap(&self, running: RunningAttempt) -> AttemptSnapshot {
        let report = match running.join.await {
            Ok(report) => report,
            Err(err) => AttemptReport::system_error(format!("worker died: {err}"), self.clock.now())
                .with_executor_logs(running.progress.snapshot().executor_logs),
        };
        AttemptSnapshot::finished(report)
    }
}

#[async_trait]
impl ComputeBackend for WorkerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> &Resources {
        &self.capacity
    }

    async fn submit(&self, assignment: Assignment) -> Result<BackendHandle, AdapterError> {
        let progress = SharedProgress::new();
        let cancel = CancellationToken::new();
        let id = assignment.id;

        let worker = Arc::clone(&self.worker);
        let reporter = progress.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { worker.run(&assignment, &reporter, token).await });

        self.lock().insert(
            id,
            RunningAttempt {
                progress,
                cancel,
                join,
            },
        );
        tracing::debug!(adapter = %self.name, assignment = %id, "attempt submitted");
        Ok(BackendHandle {
            adapter: self.name.clone(),
            assignment: id,
            external_id: None,
        })
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<AttemptSnapshot, AdapterError> {
        let id = handle.assignment;
        let (snapshot, finished) = {
            let attempts = self.lock();
            let running = attempts.get(&id).ok_or(AdapterError::UnknownHandle(id))?;
            (running.progress.snapshot(), running.join.is_finished())
        };

        if snapshot.report.is_some() {
            // The final report is handed out once.
            if let Ok(running) = self.take(id) {
                let _ = running.join.await;
            }
            return Ok(snapshot);
        }
        if finished {
            let running = self.take(id)?;
            return Ok(self.reap(running).await);
        }
        Ok(snapshot)
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), AdapterError> {
        let running = self.take(handle.assignment)?;
        running.cancel.cancel();
        if let Err(err) = running.join.await {
            tracing::warn!(adapter = %self.name, assignment = %handle.assignment, error = %err, "worker ended abnormally during cancel");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptOutcome, Executor, Task, TaskId, TaskSpec};
    use crate::ports::SystemClock;
    use chrono::Utc;
    use std::time::Duration;
    use ulid::Ulid;

    fn adapter(work_dir: &std::path::Path) -> WorkerAdapter {
        WorkerAdapter::local(
            "local",
            Resources::new(4, 8, 20),
            Arc::new(StorageRegistry::new()),
            Arc::new(SystemClock),
            WorkerSettings {
                work_dir: work_dir.to_path_buf(),
                ..WorkerSettings::default()
            },
        )
    }

    fn assignment(script: &str) -> Assignment {
        let spec = TaskSpec::new(Executor::shell("alpine", script));
        let task = Task::create(TaskId::from(Ulid::new()), spec, Utc::now(), |_| true).unwrap();
        Assignment::new(AssignmentId::from(Ulid::new()), task, 1)
    }

    async fn wait_for_report(adapter: &WorkerAdapter, handle: &BackendHandle) -> AttemptSnapshot {
        for _ in 0..200 {
            let snapshot = adapter.poll(handle).await.unwrap();
            if snapshot.report.is_some() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("attempt did not finish");
    }

    #[tokio::test]
    async fn submit_then_poll_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let handle = adapter.submit(assignment("echo hello world")).await.unwrap();

        let snapshot = wait_for_report(&adapter, &handle).await;
        let report = snapshot.report.unwrap();
        assert_eq!(report.outcome, AttemptOutcome::Complete);
        assert_eq!(report.executor_logs[0].stdout, "hello world\n");

        // The final report is only handed out once.
        assert!(matches!(
            adapter.poll(&handle).await,
            Err(AdapterError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn cancel_waits_for_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        let handle = adapter.submit(assignment("sleep 30")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(10), adapter.cancel(&handle))
            .await
            .unwrap()
            .unwrap();
        assert!(adapter.poll(&handle).await.is_err());
    }
}
