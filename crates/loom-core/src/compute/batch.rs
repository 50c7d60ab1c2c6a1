//! Batch cluster adapter: PBS/Torque, Slurm and HTCondor.
//!
//! Each attempt gets a spool directory holding the serialized assignment, a
//! job script that runs `loom worker run` on the cluster node, and the
//! progress file that remote worker keeps up to date. Polling combines the
//! cluster's view of the job with that progress file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{AdapterError, BackendHandle, ComputeBackend};
use crate::domain::{Assignment, AssignmentId, AttemptReport, Resources};
use crate::ports::Clock;
use crate::worker::{AttemptSnapshot, FileProgress};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchSystem {
    Pbs,
    Slurm,
    Htcondor,
}

/// The cluster's view of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    /// Finished, or no longer known to the cluster.
    Gone,
    /// Ended abnormally (held, removed, node failure...).
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub system: BatchSystem,
    /// Shared directory visible from the cluster nodes.
    pub spool_dir: PathBuf,
    /// `loom` binary as invoked on the cluster nodes.
    pub worker_binary: String,
    /// Config file handed to the remote worker (storage credentials etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_config: Option<PathBuf>,
    /// Where the cluster CLI tools live; looked up on PATH when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,
    /// Leave each attempt's spool directory in place once the attempt ends.
    pub keep_spool: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            system: BatchSystem::Slurm,
            spool_dir: std::env::temp_dir().join("loom-spool"),
            worker_binary: "loom".to_string(),
            worker_config: None,
            bin_dir: None,
            keep_spool: false,
        }
    }
}

pub struct BatchAdapter {
    name: String,
    capacity: Resources,
    settings: BatchSettings,
    clock: Arc<dyn Clock>,
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB)
}

impl BatchAdapter {
    pub fn new(
        name: impl Into<String>,
        capacity: Resources,
        settings: BatchSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            settings,
            clock,
        }
    }

    pub fn system(&self) -> BatchSystem {
        self.settings.system
    }

    fn spool(&self, id: AssignmentId) -> PathBuf {
        self.settings.spool_dir.join(id.to_string())
    }

    fn program(&self, name: &str) -> PathBuf {
        match &self.settings.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// The command the job runs on the node.
    fn worker_command(&self, dir: &Path) -> String {
        let mut command = shell_quote(&self.settings.worker_binary);
        if let Some(config) = &self.settings.worker_config {
            command.push_str(" --config ");
            command.push_str(&shell_quote(&config.display().to_string()));
        }
        command.push_str(" worker run --assignment ");
        command.push_str(&shell_quote(&dir.join("assignment.json").display().to_string()));
        command.push_str(" --progress ");
        command.push_str(&shell_quote(&dir.join("progress.json").display().to_string()));
        command
    }

    /// The job script, with resource directives taken from the task request.
    pub fn render_script(&self, assignment: &Assignment, dir: &Path) -> String {
        let resources = &assignment.task.spec.resources;
        let job_name = format!("loom-{}", assignment.task.id);
        let stdout = dir.join("stdout").display().to_string();
        let stderr = dir.join("stderr").display().to_string();

        let mut lines = vec!["#!/bin/bash".to_string()];
        match self.settings.system {
            BatchSystem::Pbs => {
                lines.push(format!("#PBS -N {job_name}"));
                lines.push(format!("#PBS -o {stdout}"));
                lines.push(format!("#PBS -e {stderr}"));
                if resources.cpu_cores > 0 {
                    lines.push(format!("#PBS -l nodes=1:ppn={}", resources.cpu_cores));
                }
                if resources.ram_bytes > 0 {
                    lines.push(format!("#PBS -l mem={}mb", mib(resources.ram_bytes)));
                }
                if resources.disk_bytes > 0 {
                    lines.push(format!("#PBS -l file={}mb", mib(resources.disk_bytes)));
                }
            }
            BatchSystem::Slurm => {
                lines.push(format!("#SBATCH --job-name {job_name}"));
                lines.push("#SBATCH --ntasks 1".to_string());
                lines.push(format!("#SBATCH --output {stdout}"));
                lines.push(format!("#SBATCH --error {stderr}"));
                if resources.cpu_cores > 0 {
                    lines.push(format!("#SBATCH --cpus-per-task {}", resources.cpu_cores));
                }
                if resources.ram_bytes > 0 {
                    lines.push(format!("#SBATCH --mem {}M", mib(resources.ram_bytes)));
                }
                if resources.disk_bytes > 0 {
                    lines.push(format!("#SBATCH --tmp {}M", mib(resources.disk_bytes)));
                }
            }
            // Directives live in the submit description instead.
            BatchSystem::Htcondor => {}
        }
        lines.push(String::new());
        lines.push(self.worker_command(dir));
        lines.push(String::new());
        lines.join("\n")
    }

    /// HTCondor submit description for the job script.
    pub fn render_submit_description(&self, assignment: &Assignment, dir: &Path) -> String {
        let resources = &assignment.task.spec.resources;
        let mut lines = vec![
            "universe = vanilla".to_string(),
            format!("executable = {}", dir.join("job.sh").display()),
            format!("log = {}", dir.join("condor.log").display()),
            format!("output = {}", dir.join("stdout").display()),
            format!("error = {}", dir.join("stderr").display()),
            "getenv = true".to_string(),
        ];
        if resources.cpu_cores > 0 {
            lines.push(format!("request_cpus = {}", resources.cpu_cores));
        }
        if resources.ram_bytes > 0 {
            lines.push(format!("request_memory = {}M", mib(resources.ram_bytes)));
        }
        if resources.disk_bytes > 0 {
            lines.push(format!("request_disk = {}M", mib(resources.disk_bytes)));
        }
        lines.push("queue".to_string());
        lines.push(String::new());
        lines.join("\n")
    }

    async fn run(&self, name: &str, args: &[&str]) -> Result<CommandOutput, AdapterError> {
        let program = self.program(name);
        let output = Command::new(&program)
            .args(args)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    AdapterError::Unavailable(format!("{} not found", program.display()))
                } else {
                    AdapterError::Io(err)
                }
            })?;
        Ok(CommandOutput {
            command: format!("{name} {}", args.join(" ")),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, AdapterError> {
        match self.settings.system {
            BatchSystem::Pbs => {
                let out = self.run("qstat", &["-f", job_id]).await?;
                if !out.success {
                    if out.stderr.contains("Unknown Job Id") {
                        return Ok(JobStatus::Gone);
                    }
                    return Err(out.failure());
                }
                parse_pbs_status(&out.stdout)
            }
            BatchSystem::Slurm => {
                let out = self.run("squeue", &["-h", "-j", job_id, "-o", "%T"]).await?;
                if !out.success {
                    if out.stderr.contains("Invalid job id") {
                        return Ok(JobStatus::Gone);
                    }
                    return Err(out.failure());
                }
                Ok(parse_slurm_status(&out.stdout))
            }
            BatchSystem::Htcondor => {
                let out = self.run("condor_q", &[job_id, "-af", "JobStatus"]).await?;
                if !out.success {
                    return Err(out.failure());
                }
                parse_condor_status(&out.stdout)
            }
        }
    }

    /// Removes an ended attempt's spool directory unless `keep_spool` is set.
    async fn release_spool(&self, dir: &Path) {
        if self.settings.keep_spool {
            return;
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => tracing::debug!(dir = %dir.display(), "spool removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to remove spool")
            }
        }
    }

    /// Snapshot for a job the cluster no longer runs.
    async fn ended(&self, handle: &BackendHandle, dir: &Path, why: String) -> AttemptSnapshot {
        // The worker may have written its report just before exiting.
        if let Ok(Some(snapshot)) = FileProgress::read(&dir.join("progress.json")).await
            && snapshot.report.is_some()
        {
            return snapshot;
        }
        let logs = FileProgress::read(&dir.join("progress.json"))
            .await
            .ok()
            .flatten()
            .map(|s| s.executor_logs)
            .unwrap_or_default();
        let stderr = tokio::fs::read_to_string(dir.join("stderr"))
            .await
            .unwrap_or_default();
        let mut reason = format!(
            "batch job {} {why} without a report",
            handle.external_id.as_deref().unwrap_or("?")
        );
        if let Some(line) = stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            reason.push_str(": ");
            reason.push_str(line.trim());
        }
        AttemptSnapshot::finished(
            AttemptReport::system_error(reason, self.clock.now()).with_executor_logs(logs),
        )
    }
}

struct CommandOutput {
    command: String,
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn failure(&self) -> AdapterError {
        AdapterError::Command {
            command: self.command.clone(),
            message: self.stderr.trim().to_string(),
        }
    }
}

/// `qsub` prints the job id, e.g. `123.server`.
pub fn parse_pbs_job_id(stdout: &str) -> Result<String, AdapterError> {
    let id = stdout.trim();
    if id.is_empty() {
        return Err(AdapterError::Parse {
            what: "qsub output",
            output: stdout.to_string(),
        });
    }
    Ok(id.to_string())
}

/// `sbatch --parsable` prints `jobid` or `jobid;cluster`.
pub fn parse_slurm_job_id(stdout: &str) -> Result<String, AdapterError> {
    let id = stdout.trim().split(';').next().unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(AdapterError::Parse {
            what: "sbatch output",
            output: stdout.to_string(),
        });
    }
    Ok(id.to_string())
}

/// `condor_submit` prints `1 job(s) submitted to cluster 42.`
pub fn parse_condor_job_id(stdout: &str) -> Result<String, AdapterError> {
    stdout
        .split("submitted to cluster")
        .nth(1)
        .map(|rest| rest.trim().trim_end_matches('.').trim().to_string())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| AdapterError::Parse {
            what: "condor_submit output",
            output: stdout.to_string(),
        })
}

/// Reads `job_state = X` from `qstat -f`.
pub fn parse_pbs_status(stdout: &str) -> Result<JobStatus, AdapterError> {
    let state = stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("job_state"))
        .filter_map(|rest| rest.trim().strip_prefix('='))
        .map(str::trim)
        .next()
        .ok_or_else(|| AdapterError::Parse {
            what: "qstat output",
            output: stdout.to_string(),
        })?;
    Ok(match state {
        "Q" | "H" | "W" | "T" => JobStatus::Queued,
        "R" | "E" | "S" => JobStatus::Running,
        "C" | "F" | "X" => JobStatus::Gone,
        other => JobStatus::Failed(format!("unexpected PBS job state {other}")),
    })
}

/// One state name from `squeue -o %T`; empty output means the job is gone.
pub fn parse_slurm_status(stdout: &str) -> JobStatus {
    match stdout.trim() {
        "" | "COMPLETED" | "COMPLETING" => JobStatus::Gone,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobStatus::Queued,
        "RUNNING" => JobStatus::Running,
        other => JobStatus::Failed(other.to_lowercase()),
    }
}

/// Numeric `JobStatus` from `condor_q -af JobStatus`.
pub fn parse_condor_status(stdout: &str) -> Result<JobStatus, AdapterError> {
    let raw = stdout.trim();
    if raw.is_empty() {
        return Ok(JobStatus::Gone);
    }
    let code: u32 = raw.parse().map_err(|_| AdapterError::Parse {
        what: "condor_q output",
        output: stdout.to_string(),
    })?;
    Ok(match code {
        1 => JobStatus::Queued,
        2 | 6 | 7 => JobStatus::Running,
        4 => JobStatus::Gone,
        3 => JobStatus::Failed("removed".to_string()),
        5 => JobStatus::Failed("held".to_string()),
        other => JobStatus::Failed(format!("unexpected status {other}")),
    })
}

#[async_trait]
impl ComputeBackend for BatchAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> &Resources {
        &self.capacity
    }

    async fn submit(&self, assignment: Assignment) -> Result<BackendHandle, AdapterError> {
        let dir = self.spool(assignment.id);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(&assignment).map_err(std::io::Error::other)?;
        tokio::fs::write(dir.join("assignment.json"), json).await?;
        let script = dir.join("job.sh");
        tokio::fs::write(&script, self.render_script(&assignment, &dir)).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await?;
        }

        let script_arg = script.display().to_string();
        let job_id = match self.settings.system {
            BatchSystem::Pbs => {
                let out = self.run("qsub", &[&script_arg]).await?;
                if !out.success {
                    return Err(out.failure());
                }
                parse_pbs_job_id(&out.stdout)?
            }
            BatchSystem::Slurm => {
                let out = self.run("sbatch", &["--parsable", &script_arg]).await?;
                if !out.success {
                    return Err(out.failure());
                }
                parse_slurm_job_id(&out.stdout)?
            }
            BatchSystem::Htcondor => {
                let description = dir.join("job.submit");
                tokio::fs::write(
                    &description,
                    self.render_submit_description(&assignment, &dir),
                )
                .await?;
                let out = self
                    .run("condor_submit", &[&description.display().to_string()])
                    .await?;
                if !out.success {
                    return Err(out.failure());
                }
                parse_condor_job_id(&out.stdout)?
            }
        };

        tracing::info!(
            adapter = %self.name,
            task_id = %assignment.task.id,
            job_id = %job_id,
            system = ?self.settings.system,
            "batch job submitted"
        );
        Ok(BackendHandle {
            adapter: self.name.clone(),
            assignment: assignment.id,
            external_id: Some(job_id),
        })
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<AttemptSnapshot, AdapterError> {
        let job_id = handle
            .external_id
            .as_deref()
            .ok_or(AdapterError::UnknownHandle(handle.assignment))?;
        let dir = self.spool(handle.assignment);

        let progress = FileProgress::read(&dir.join("progress.json")).await?;
        let snapshot = match progress {
            Some(snapshot) if snapshot.report.is_some() => snapshot,
            progress => match self.job_status(job_id).await? {
                JobStatus::Queued | JobStatus::Running => progress.unwrap_or_default(),
                JobStatus::Gone => self.ended(handle, &dir, "ended".to_string()).await,
                JobStatus::Failed(why) => self.ended(handle, &dir, why).await,
            },
        };
        // A final snapshot is the last poll of this attempt.
        if snapshot.report.is_some() {
            self.release_spool(&dir).await;
        }
        Ok(snapshot)
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<(), AdapterError> {
        let job_id = handle
            .external_id
            .as_deref()
            .ok_or(AdapterError::UnknownHandle(handle.assignment))?;
        let out = match self.settings.system {
            BatchSystem::Pbs => self.run("qdel", &[job_id]).await?,
            BatchSystem::Slurm => self.run("scancel", &[job_id]).await?,
            BatchSystem::Htcondor => self.run("condor_rm", &[job_id]).await?,
        };
        if !out.success {
            return Err(out.failure());
        }
        tracing::info!(adapter = %self.name, job_id, "batch job canceled");
        self.release_spool(&self.spool(handle.assignment)).await;
        Ok(())
    }
}
