use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod command;
mod error;
mod greenwave;
mod opm;
mod registry;
mod retry;
mod settings;
mod state;
mod tasks;

#[cfg(test)]
mod testing;

use settings::WorkerSettings;
use state::WorkerState;
use tasks::TaskInvocation;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one queued task and report a failure on its request
    RunTask {
        /// JSON file with `{"task": "<handler>", "args": {...}}`
        #[arg(long)]
        task_file: PathBuf,
    },
    /// Load and validate the worker configuration
    CheckConfig,
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
}

/// Console logging, plus `{logs_dir}/{request_id}.log` when a request log directory is set
fn init_logging(request_log: Option<(&Path, u64)>) -> Result<()> {
    let file_layer = match request_log {
        Some((logs_dir, request_id)) => {
            fs::create_dir_all(logs_dir)
                .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
            let path = logs_dir.join(format!("{}.log", request_id));
            let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

async fn run_task(task_file: &Path) -> Result<()> {
    let content = fs::read_to_string(task_file)
        .with_context(|| format!("Failed to read task file {}", task_file.display()))?;
    let task: TaskInvocation = serde_json::from_str(&content)
        .with_context(|| format!("Invalid task invocation in {}", task_file.display()))?;
    let settings = WorkerSettings::new().context("Failed to load the worker configuration")?;

    let request_id = task.request_id();
    init_logging(settings.iib_request_logs_dir.as_deref().map(|dir| (dir, request_id)))?;

    let state = WorkerState::new(settings).context("Failed to initialize the worker")?;
    tasks::dispatch(&state, &task)
        .await
        .with_context(|| format!("{} failed for request {}", task.name(), request_id))?;
    info!("Request {} finished", request_id);
    Ok(())
}

fn check_config() -> Result<()> {
    init_logging(None)?;
    let settings = WorkerSettings::new().context("Failed to load the worker configuration")?;
    settings
        .validate_binaries()
        .context("The worker configuration references missing binaries")?;
    println!("✓ Configuration is valid");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::RunTask { task_file } => run_task(&task_file).await,
        Commands::CheckConfig => check_config(),
    }
}
