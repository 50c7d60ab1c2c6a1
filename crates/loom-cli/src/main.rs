mod client;
mod http;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loom_core::domain::{Assignment, TaskId, TaskSpec, TaskState, TaskView};
use loom_core::ports::SystemClock;
use loom_core::worker::{ContainerRunner, ExecutorRunner, FileProgress, ProcessRunner, Worker};
use loom_core::{AppBuilder, Config};

use crate::client::LoomClient;

#[derive(Parser)]
#[command(name = "loom", version, about = "Task execution service")]
struct Cli {
    /// JSON config file; a missing file means defaults.
    #[arg(long, global = true, default_value = "loom.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server and the scheduler.
    Server,
    /// Worker commands (used by batch backends).
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Talk to a running server.
    Task {
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        server: String,
        #[command(subcommand)]
        command: TaskCommand,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Run one attempt described by an assignment file.
    Run {
        #[arg(long)]
        assignment: PathBuf,
        #[arg(long)]
        progress: PathBuf,
        #[arg(long, value_enum, default_value_t = RunnerKind::Container)]
        runner: RunnerKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RunnerKind {
    Process,
    Container,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Submit a task spec (JSON file, `-` for stdin) and print its id.
    Create { spec: PathBuf },
    Get {
        id: TaskId,
        #[arg(long, default_value = "FULL")]
        view: TaskView,
    },
    List {
        #[arg(long)]
        state: Option<TaskState>,
        #[arg(long)]
        name_prefix: Option<String>,
        #[arg(long, default_value = "BASIC")]
        view: TaskView,
    },
    Cancel { id: TaskId },
    /// Submit a task spec and wait for it to finish.
    Run {
        spec: PathBuf,
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("loom=info,loom_core=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server => serve(&cli.config).await,
        Command::Worker {
            command:
                WorkerCommand::Run {
                    assignment,
                    progress,
                    runner,
                },
        } => run_worker(&cli.config, &assignment, &progress, runner).await,
        Command::Task { server, command } => task(LoomClient::new(server), command).await,
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let address = config.server.http_address.clone();
    let disable_http_cache = config.server.disable_http_cache;
    let app = AppBuilder::new(config).start()?;

    let router = http::router(app.service().clone(), disable_http_cache);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    let shutdown = shutdown_signal()?;
    tracing::info!(%address, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutting down");
        })
        .await?;

    app.shutdown_and_join().await;
    Ok(())
}

async fn run_worker(
    config_path: &Path,
    assignment_path: &Path,
    progress_path: &Path,
    runner: RunnerKind,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let raw = tokio::fs::read(assignment_path)
        .await
        .with_context(|| format!("reading {}", assignment_path.display()))?;
    let assignment: Assignment = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing {}", assignment_path.display()))?;

    let storage = Arc::new(config.storage.build()?);
    let runner: Arc<dyn ExecutorRunner> = match runner {
        RunnerKind::Process => Arc::new(ProcessRunner),
        RunnerKind::Container => Arc::new(ContainerRunner::new(
            config.worker.container_binary.clone(),
        )),
    };
    let worker = Worker::new(storage, runner, Arc::new(SystemClock), config.worker.clone());
    let reporter = FileProgress::new(progress_path);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let shutdown = shutdown_signal()?;
    tokio::spawn(async move {
        shutdown.await;
        tracing::info!("worker interrupted, cancelling");
        on_signal.cancel();
    });

    let report = worker.run(&assignment, &reporter, cancel).await;
    tracing::info!(outcome = ?report.outcome, "worker done");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM. Batch schedulers stop jobs with SIGTERM,
/// so both must reach the same shutdown path.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut terminate =
        signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    })
}

fn read_spec(path: &Path) -> Result<TaskSpec> {
    let raw = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("reading stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    serde_json::from_str(&raw).context("parsing task spec")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn task(client: LoomClient, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Create { spec } => {
            let id = client.create(&read_spec(&spec)?).await?;
            println!("{id}");
        }
        TaskCommand::Get { id, view } => print_json(&client.get(id, view).await?)?,
        TaskCommand::List {
            state,
            name_prefix,
            view,
        } => print_json(&client.list(state, name_prefix.as_deref(), view).await?)?,
        TaskCommand::Cancel { id } => client.cancel(id).await?,
        TaskCommand::Run { spec, poll_ms } => {
            let id = client.create(&read_spec(&spec)?).await?;
            eprintln!("submitted {id}");
            let mut last = None;
            loop {
                let task = client.get(id, TaskView::Minimal).await?;
                if last != Some(task.state) {
                    eprintln!("{id}: {}", task.state);
                    last = Some(task.state);
                }
                if task.state.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            }
            print_json(&client.get(id, TaskView::Full).await?)?;
        }
    }
    Ok(())
}
