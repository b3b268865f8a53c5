use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use harvest_engine_rs::helpers::{init_tracing, shutdown_signal};
use harvest_engine_rs::jobs::{load_links, task_name_for, DownloadParams};
use harvest_engine_rs::task::{TaskFilter, TaskId, TaskRecord, TaskStatus};
use harvest_engine_rs::{Engine, EngineConfig, EngineError, StoreBackend};

const SETTLE_POLL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "harvest-engine", about = "Resumable batch downloads with persisted task state")]
struct Cli {
    /// Task store backend: sqlite, json or memory.
    #[arg(long, env = "HARVEST_STORE")]
    store: Option<StoreBackend>,

    #[arg(long, env = "HARVEST_STORE_PATH")]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download every URL listed in a links file.
    Download {
        links: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Continue a paused task.
    Resume { id: TaskId },
    /// Mark a task as stopped.
    Stop { id: TaskId },
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Show { id: TaskId },
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut cfg = EngineConfig::from_env()
            .map_err(anyhow::Error::msg)
            .context("invalid HARVEST_* environment")?;
        if let Some(backend) = self.store {
            cfg.store_backend = backend;
            cfg.store_path = backend.default_path();
        }
        if let Some(path) = &self.store_path {
            cfg.store_path = path.clone();
        }
        Ok(cfg.normalized())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.engine_config()?;
    let engine = Arc::new(Engine::new(config).context("failed to open task store")?);

    match cli.command {
        Command::Download { links, out, name } => {
            let urls = load_links(&links)
                .with_context(|| format!("failed to read links file {}", links.display()))?;
            if urls.is_empty() {
                bail!("no URLs in {}", links.display());
            }
            let name = name.unwrap_or_else(|| task_name_for(&links));
            let params = DownloadParams { urls, output_dir: out };
            let id = engine.submit(params.new_task(&name))?;
            info!(task_id = id, name = %name, "download submitted");
            supervise(engine, id).await
        }
        Command::Resume { id } => {
            engine.resume(id).with_context(|| format!("cannot resume task {}", id))?;
            supervise(engine, id).await
        }
        Command::Stop { id } => {
            engine.stop(id).with_context(|| format!("cannot stop task {}", id))?;
            show(&engine, id)
        }
        Command::List { status, limit } => {
            let filter = TaskFilter {
                status,
                limit,
                ..TaskFilter::default()
            };
            let tasks = engine.manager().get_tasks(&filter)?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in &tasks {
                println!("{}", summary_line(task));
            }
            Ok(())
        }
        Command::Show { id } => show(&engine, id),
    }
}

/// Waits for the task to settle, pausing everything on Ctrl-C or SIGTERM.
async fn supervise(engine: Arc<Engine>, id: TaskId) -> Result<()> {
    let waiter = Arc::clone(&engine);
    let settled = tokio::task::spawn_blocking(move || loop {
        let record = waiter.manager().wait_until_settled(id, SETTLE_POLL)?;
        if record.status != TaskStatus::Running {
            return Ok::<_, EngineError>(record);
        }
    });

    tokio::select! {
        joined = settled => {
            let record = joined.context("task watcher panicked")??;
            println!("{}", summary_line(&record));
            if let Some(result) = &record.result_data {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            if record.status == TaskStatus::Failed {
                bail!(
                    "task {} failed: {}",
                    id,
                    record.error_message.unwrap_or_default()
                );
            }
            Ok(())
        }
        _ = shutdown_signal() => {
            warn!(task_id = id, "interrupted, shutting down");
            let report = engine.shutdown();
            for paused in &report.paused {
                println!("task {} paused; continue with `harvest-engine resume {}`", paused, paused);
            }
            for stopped in &report.stopped {
                println!("task {} stopped", stopped);
            }
            for (task, err) in &report.errors {
                eprintln!("task {}: {}", task, err);
            }
            Ok(())
        }
    }
}

fn show(engine: &Engine, id: TaskId) -> Result<()> {
    let record = engine
        .task(id)?
        .with_context(|| format!("task {} not found", id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn summary_line(task: &TaskRecord) -> String {
    format!(
        "[{}] #{} {} ({}) {}% {}/{} failed={}",
        task.status,
        task.id,
        task.task_name,
        task.task_type,
        task.progress,
        task.processed_items,
        task.total_items,
        task.failed_items
    )
}
