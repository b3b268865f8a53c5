use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use harvest_engine_rs::{EngineConfig, StoreBackend};

use crate::models::CLIConfig;

#[derive(Parser, Debug)]
#[command(name = "harvest_debug_cli", about = "Inspect persisted harvest tasks")]
struct Args {
    #[arg(long, env = "HARVEST_STORE")]
    store: Option<StoreBackend>,

    #[arg(long = "path", env = "HARVEST_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Rows shown by /tasks.
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Milliseconds between /watch refreshes.
    #[arg(long, default_value_t = 1000)]
    watch_ms: u64,

    /// Refreshes per /watch before returning to the prompt.
    #[arg(long, default_value_t = 30)]
    watch_rounds: u32,
}

pub fn parse_config() -> Result<CLIConfig, String> {
    let args = Args::parse();
    let mut engine = EngineConfig::from_env()?;
    if let Some(backend) = args.store {
        engine.store_backend = backend;
        engine.store_path = backend.default_path();
    }
    if let Some(path) = args.store_path {
        engine.store_path = path;
    }
    Ok(CLIConfig {
        engine: engine.normalized(),
        limit: args.limit.max(1),
        watch_interval: Duration::from_millis(args.watch_ms.max(50)),
        watch_rounds: args.watch_rounds.max(1),
    })
}
