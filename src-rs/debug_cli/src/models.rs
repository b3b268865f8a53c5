use std::time::Duration;

use harvest_engine_rs::EngineConfig;

#[derive(Clone, Debug)]
pub struct CLIConfig {
    pub engine: EngineConfig,
    pub limit: usize,
    pub watch_interval: Duration,
    pub watch_rounds: u32,
}
