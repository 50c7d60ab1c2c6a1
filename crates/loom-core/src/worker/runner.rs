//! Executor runners: how one executor step is launched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::mapper::Volume;

/// Exit code reported when the program of a step does not exist.
pub const COMMAND_NOT_FOUND: i32 = 127;

/// One executor, resolved against an attempt's work directory.
#[derive(Debug, Clone)]
pub struct ExecutorStep {
    pub index: usize,
    pub image: String,
    pub command: Vec<String>,
    /// Working directory inside the container, if declared.
    pub workdir: Option<String>,
    /// Host directory the step runs in.
    pub host_workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Host file fed to the step's stdin.
    pub stdin: Option<PathBuf>,
    pub volumes: Vec<Volume>,
    /// Unique per attempt and step; used to address the container on cancel.
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepExit {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl StepExit {
    fn not_found(program: &str) -> Self {
        Self {
            exit_code: COMMAND_NOT_FOUND,
            stdout: Vec::new(),
            stderr: format!("{program}: command not found\n").into_bytes(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("step was canceled")]
    Canceled,

    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to collect output of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step {index} has an empty command")]
    EmptyCommand { index: usize },
}

#[async_trait]
pub trait ExecutorRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one step to completion, or until `cancel` fires.
    ///
    /// A nonzero exit is a successful run; only launch failures and
    /// cancellation are errors.
    async fn run(&self, step: &ExecutorStep, cancel: &CancellationToken)
    -> Result<StepExit, RunError>;
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn stdin_for(step: &ExecutorStep, program: &str) -> Result<Stdio, RunError> {
    match &step.stdin {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|source| RunError::Start {
                    program: program.to_string(),
                    source,
                })?;
            Ok(Stdio::from(file.into_std().await))
        }
        None => Ok(Stdio::null()),
    }
}

/// Spawn `command`, wait for it, and collect its output. Dropping the future
/// on cancel kills the child (`kill_on_drop`).
async fn run_to_exit(
    mut command: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<Option<StepExit>, RunError> {
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RunError::Start {
                program: program.to_string(),
                source,
            });
        }
    };

    tokio::select! {
        output = child.wait_with_output() => {
            let output = output.map_err(|source| RunError::Wait {
                program: program.to_string(),
                source,
            })?;
            Ok(Some(StepExit {
                exit_code: exit_code(output.status),
                stdout: output.stdout,
                stderr: output.stderr,
            }))
        }
        _ = cancel.cancelled() => Err(RunError::Canceled),
    }
}

/// Runs the command directly on the host, in the mapped work directory.
/// The image is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ExecutorRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        step: &ExecutorStep,
        cancel: &CancellationToken,
    ) -> Result<StepExit, RunError> {
        let (program, args) = step
            .command
            .split_first()
            .ok_or(RunError::EmptyCommand { index: step.index })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&step.host_workdir)
            .envs(&step.env)
            .stdin(stdin_for(step, program).await?);

        match run_to_exit(command, program, cancel).await? {
            Some(exit) => Ok(exit),
            None => Ok(StepExit::not_found(program)),
        }
    }
}

/// Runs each step in a container through a docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    binary: String,
}

impl ContainerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Arguments of the `run` invocation for `step`.
    pub fn run_args(&self, step: &ExecutorStep) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            step.container_name.clone(),
        ];
        if step.stdin.is_some() {
            args.push("-i".to_string());
        }
        for volume in &step.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.host.display(), volume.container));
        }
        if let Some(workdir) = &step.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &step.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(step.image.clone());
        args.extend(step.command.iter().cloned());
        args
    }

    async fn remove(&self, name: &str) {
        let result = Command::new(&self.binary)
            .args(["rm", "-f", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(err) = result {
            tracing::warn!(container = name, error = %err, "failed to remove container");
        }
    }
}

#[async_trait]
impl ExecutorRunner for ContainerRunner {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn run(
        &self,
        step: &ExecutorStep,
        cancel: &CancellationToken,
    ) -> Result<StepExit, RunError> {
        if step.command.is_empty() {
            return Err(RunError::EmptyCommand { index: step.index });
        }

        let mut command = Command::new(&self.binary);
        command
            .args(self.run_args(step))
            .current_dir(&step.host_workdir)
            .stdin(stdin_for(step, &self.binary).await?);

        match run_to_exit(command, &self.binary, cancel).await {
            Ok(Some(exit)) => Ok(exit),
            // The container CLI itself is missing: infrastructure, not the task.
            Ok(None) => Err(RunError::Start {
                program: self.binary.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            Err(RunError::Canceled) => {
                self.remove(&step.container_name).await;
                Err(RunError::Canceled)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(command: &[&str], dir: &std::path::Path) -> ExecutorStep {
        ExecutorStep {
            index: 0,
            image: "alpine".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            workdir: None,
            host_workdir: dir.to_path_buf(),
            env: BTreeMap::new(),
            stdin: None,
            volumes: Vec::new(),
            container_name: "loom-test-1-0".into(),
        }
    }

    #[tokio::test]
    async fn process_runner_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = step(&["sh", "-c", "echo hello world; echo oops >&2; exit 3"], dir.path());
        s.env.insert("GREETING".into(), "hi".into());

        let exit = ProcessRunner
            .run(&s, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit.exit_code, 3);
        assert_eq!(exit.stdout, b"hello world\n");
        assert_eq!(exit.stderr, b"oops\n");
    }

    #[tokio::test]
    async fn process_runner_feeds_stdin_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stdin.txt");
        tokio::fs::write(&input, "from file\n").await.unwrap();
        let mut s = step(&["sh", "-c", "cat; echo $GREETING"], dir.path());
        s.stdin = Some(input);
        s.env.insert("GREETING".into(), "hi".into());

        let exit = ProcessRunner
            .run(&s, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit.exit_code, 0);
        assert_eq!(String::from_utf8(exit.stdout).unwrap(), "from file\nhi\n");
    }

    #[tokio::test]
    async fn missing_program_exits_127() {
        let dir = tempfile::tempdir().unwrap();
        let s = step(&["definitely-not-a-real-program-xyz"], dir.path());
        let exit = ProcessRunner
            .run(&s, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(exit.exit_code, COMMAND_NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_kills_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let s = step(&["sleep", "30"], dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = ProcessRunner.run(&s, &cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Canceled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn container_run_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = step(&["cat", "/opt/inputs/a.txt"], dir.path());
        s.workdir = Some("/opt/workdir".into());
        s.env.insert("K".into(), "V".into());
        s.volumes.push(Volume {
            host: PathBuf::from("/w/opt/inputs"),
            container: "/opt/inputs".into(),
        });

        let args = ContainerRunner::new("docker").run_args(&s);
        assert_eq!(
            args,
            vec![
                "run", "--rm", "--name", "loom-test-1-0", "-v", "/w/opt/inputs:/opt/inputs",
                "-w", "/opt/workdir", "-e", "K=V", "alpine", "cat", "/opt/inputs/a.txt",
            ]
        );
    }

    #[tokio::test]
    async fn missing_container_cli_is_a_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let s = step(&["true"], dir.path());
        let err = ContainerRunner::new("no-such-container-cli-xyz")
            .run(&s, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Start { .. }));
    }
}
