//! Worker: runs one attempt of a task.
//!
//! Flow: prepare the work directory, stage inputs, run the executors in
//! order, stage outputs. Every failure is folded into the returned
//! [`AttemptReport`]; the worker itself never errors.

pub mod mapper;
pub mod progress;
pub mod runner;

pub use mapper::{InvalidPath, PathMapper, Volume};
pub use progress::{AttemptSnapshot, FileProgress, Phase, ProgressReporter, SharedProgress};
pub use runner::{ContainerRunner, ExecutorRunner, ExecutorStep, ProcessRunner, RunError, StepExit};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::{Assignment, AttemptReport, ExecutorLog, Input, Output, OutputFileLog, Task};
use crate::ports::Clock;
use crate::storage::StorageRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Parent of the per-attempt work directories.
    pub work_dir: PathBuf,
    pub keep_work_dir: bool,
    /// Captured stdout/stderr are cut to their last `max_log_bytes` bytes.
    pub max_log_bytes: usize,
    /// docker-compatible CLI used by container runners.
    pub container_binary: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("loom-work"),
            keep_work_dir: false,
            max_log_bytes: 10 * 1024,
            container_binary: "docker".to_string(),
        }
    }
}

/// Why an attempt stopped early.
enum Stop {
    Canceled,
    System(String),
    Executor(String),
}

pub struct Worker {
    storage: Arc<StorageRegistry>,
    runner: Arc<dyn ExecutorRunner>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        storage: Arc<StorageRegistry>,
        runner: Arc<dyn ExecutorRunner>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            storage,
            runner,
            clock,
            settings,
        }
    }

    /// Run one attempt to its terminal outcome.
    pub async fn run(
        &self,
        assignment: &Assignment,
        reporter: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> AttemptReport {
        let task = &assignment.task;
        let work_dir = self.settings.work_dir.join(assignment.id.to_string());
        tracing::info!(
            task_id = %task.id,
            attempt = assignment.attempt,
            runner = self.runner.name(),
            work_dir = %work_dir.display(),
            "attempt started"
        );

        let mut executor_logs = Vec::new();
        let result = self
            .execute(assignment, &work_dir, reporter, &cancel, &mut executor_logs)
            .await;

        let end_time = self.clock.now();
        let report = match result {
            Ok(outputs) => AttemptReport::complete(end_time).with_outputs(outputs),
            Err(Stop::Executor(reason)) => AttemptReport::executor_error(reason, end_time),
            Err(Stop::System(reason)) => AttemptReport::system_error(reason, end_time),
            Err(Stop::Canceled) => AttemptReport::canceled(end_time),
        }
        .with_executor_logs(executor_logs);

        if !self.settings.keep_work_dir
            && let Err(err) = tokio::fs::remove_dir_all(&work_dir).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(work_dir = %work_dir.display(), error = %err, "failed to remove work dir");
        }

        tracing::info!(
            task_id = %task.id,
            attempt = assignment.attempt,
            outcome = ?report.outcome,
            reason = report.reason.as_deref().unwrap_or(""),
            "attempt finished"
        );
        reporter.finished(&report).await;
        report
    }

    async fn execute(
        &self,
        assignment: &Assignment,
        work_dir: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
        executor_logs: &mut Vec<ExecutorLog>,
    ) -> Result<Vec<OutputFileLog>, Stop> {
        let task = &assignment.task;
        reporter.phase(Phase::Initializing).await;

        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| Stop::System(format!("creating work dir {}: {e}", work_dir.display())))?;
        let mapper = PathMapper::new(work_dir);

        tokio::select! {
            staged = self.stage_inputs(task, &mapper) => staged?,
            _ = cancel.cancelled() => return Err(Stop::Canceled),
        }
        self.prepare_dirs(task, &mapper).await?;

        reporter.phase(Phase::Running).await;
        let volumes = mapper
            .volumes(task)
            .map_err(|e| Stop::System(e.to_string()))?;

        for (index, executor) in task.spec.executors.iter().enumerate() {
            let host_workdir = match &executor.workdir {
                Some(workdir) => map_path(&mapper, workdir)?,
                None => mapper.work_dir().to_path_buf(),
            };
            let stdin = executor
                .stdin
                .as_deref()
                .map(|path| map_path(&mapper, path))
                .transpose()?;
            let step = ExecutorStep {
                index,
                image: executor.image.clone(),
                command: executor.command.clone(),
                workdir: executor.workdir.clone(),
                host_workdir,
                env: executor.env.clone(),
                stdin,
                volumes: volumes.clone(),
                container_name: format!("loom-{}-{}-{}", task.id, assignment.attempt, index)
                    .to_lowercase(),
            };

            let start_time = self.clock.now();
            let started = ExecutorLog {
                index,
                start_time,
                end_time: None,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
            };
            reporter.executor_log(started.clone()).await;

            let exit = match self.runner.run(&step, cancel).await {
                Ok(exit) => exit,
                Err(err) => {
                    // The step never exited on its own: keep it without an exit code.
                    executor_logs.push(started);
                    return Err(match err {
                        RunError::Canceled => Stop::Canceled,
                        err => Stop::System(format!("executor {index}: {err}")),
                    });
                }
            };

            if let Some(path) = &executor.stdout {
                write_stdio(&mapper, path, &exit.stdout).await?;
            }
            if let Some(path) = &executor.stderr {
                write_stdio(&mapper, path, &exit.stderr).await?;
            }

            let log = ExecutorLog {
                index,
                start_time,
                end_time: Some(self.clock.now()),
                exit_code: Some(exit.exit_code),
                stdout: tail(&exit.stdout, self.settings.max_log_bytes),
                stderr: tail(&exit.stderr, self.settings.max_log_bytes),
            };
            executor_logs.push(log.clone());
            reporter.executor_log(log).await;

            if exit.exit_code != 0 {
                tracing::info!(task_id = %task.id, index, exit_code = exit.exit_code, "executor failed");
                return Err(Stop::Executor(format!(
                    "executor {index} exited with code {}",
                    exit.exit_code
                )));
            }
        }

        tokio::select! {
            outputs = self.stage_outputs(task, &mapper) => outputs,
            _ = cancel.cancelled() => Err(Stop::Canceled),
        }
    }

    async fn stage_inputs(&self, task: &Task, mapper: &PathMapper) -> Result<(), Stop> {
        let downloads = task
            .spec
            .inputs
            .iter()
            .map(|input| self.stage_input(input, mapper));
        try_join_all(downloads).await.map(|_| ())
    }

    async fn stage_input(&self, input: &Input, mapper: &PathMapper) -> Result<(), Stop> {
        let host = map_path(mapper, &input.path)?;
        if let Some(content) = &input.content {
            if let Some(parent) = host.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Stop::System(format!("input {}: {e}", input.path)))?;
            }
            return tokio::fs::write(&host, content)
                .await
                .map_err(|e| Stop::System(format!("input {}: {e}", input.path)));
        }
        self.storage
            .get(&input.url, &host, input.file_type)
            .await
            .map_err(|e| Stop::System(format!("staging input {}: {e}", input.url)))
    }

    /// Parents of outputs and declared stdio files, and executor workdirs,
    /// must exist before the first executor runs.
    async fn prepare_dirs(&self, task: &Task, mapper: &PathMapper) -> Result<(), Stop> {
        let mut dirs = Vec::new();
        for output in &task.spec.outputs {
            if let Some(parent) = map_path(mapper, &output.path)?.parent() {
                dirs.push(parent.to_path_buf());
            }
        }
        for executor in &task.spec.executors {
            if let Some(workdir) = &executor.workdir {
                dirs.push(map_path(mapper, workdir)?);
            }
            for stdio in [&executor.stdout, &executor.stderr].into_iter().flatten() {
                if let Some(parent) = map_path(mapper, stdio)?.parent() {
                    dirs.push(parent.to_path_buf());
                }
            }
        }
        for dir in dirs {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Stop::System(format!("creating {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    async fn stage_outputs(&self, task: &Task, mapper: &PathMapper) -> Result<Vec<OutputFileLog>, Stop> {
        let uploads = task
            .spec
            .outputs
            .iter()
            .map(|output| self.stage_output(output, mapper));
        let uploaded = try_join_all(uploads).await?;
        Ok(uploaded.into_iter().flatten().collect())
    }

    async fn stage_output(
        &self,
        output: &Output,
        mapper: &PathMapper,
    ) -> Result<Vec<OutputFileLog>, Stop> {
        let host = map_path(mapper, &output.path)?;
        let mut files = self
            .storage
            .put(&output.url, &host, output.file_type)
            .await
            .map_err(|e| Stop::System(format!("staging output {}: {e}", output.url)))?;
        // Report container paths, not host paths.
        for file in &mut files {
            let container_path = Path::new(&file.path)
                .strip_prefix(mapper.work_dir())
                .ok()
                .map(|relative| format!("/{}", relative.display()));
            if let Some(container_path) = container_path {
                file.path = container_path;
            }
        }
        Ok(files)
    }
}

fn map_path(mapper: &PathMapper, path: &str) -> Result<PathBuf, Stop> {
    mapper.host_path(path).map_err(|e| Stop::System(e.to_string()))
}

async fn write_stdio(mapper: &PathMapper, path: &str, bytes: &[u8]) -> Result<(), Stop> {
    let host = map_path(mapper, path)?;
    tokio::fs::write(&host, bytes)
        .await
        .map_err(|e| Stop::System(format!("writing {path}: {e}")))
}

/// The last `max` bytes of `bytes` as (lossy) UTF-8.
pub fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
