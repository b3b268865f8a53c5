use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::helpers::{env_list, env_parse, env_string};
use crate::session::{HttpSessionConfig, DEFAULT_CHALLENGE_MARKERS, DEFAULT_USER_AGENTS};
use crate::task::DEFAULT_POLL_INTERVAL;
use crate::units::RunnerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Json,
    Sqlite,
    Memory,
}

impl StoreBackend {
    /// Store file used when no path is configured.
    pub fn default_path(self) -> PathBuf {
        PathBuf::from(match self {
            StoreBackend::Json => "harvest_tasks.json",
            StoreBackend::Sqlite | StoreBackend::Memory => "harvest_tasks.db",
        })
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreBackend::Json => "json",
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Memory => "memory",
        })
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StoreBackend::Json),
            "sqlite" | "db" => Ok(StoreBackend::Sqlite),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub challenge_markers: Vec<String>,
    pub user_agents: Vec<String>,
    pub warmup_urls: Vec<String>,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Sqlite,
            store_path: StoreBackend::Sqlite.default_path(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: 45,
            max_attempts: 3,
            request_timeout: Duration::from_secs(30),
            challenge_markers: DEFAULT_CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect(),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            warmup_urls: Vec::new(),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `HARVEST_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut cfg = Self::default();
        if let Some(raw) = env_string("HARVEST_STORE") {
            cfg.store_backend = raw.parse()?;
        }
        if let Some(path) = env_string("HARVEST_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        } else {
            cfg.store_path = cfg.store_backend.default_path();
        }
        if let Some(ms) = env_parse::<u64>("HARVEST_POLL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = env_parse::<usize>("HARVEST_BATCH_SIZE")? {
            cfg.batch_size = size;
        }
        if let Some(attempts) = env_parse::<u32>("HARVEST_MAX_ATTEMPTS")? {
            cfg.max_attempts = attempts;
        }
        if let Some(secs) = env_parse::<u64>("HARVEST_REQUEST_TIMEOUT_SECS")? {
            cfg.request_timeout = Duration::from_secs(secs);
        }
        let markers = env_list("HARVEST_CHALLENGE_MARKERS", "HARVEST_CHALLENGE_MARKER");
        if !markers.is_empty() {
            cfg.challenge_markers = markers;
        }
        let agents = env_list("HARVEST_USER_AGENTS", "HARVEST_USER_AGENT");
        if !agents.is_empty() {
            cfg.user_agents = agents;
        }
        cfg.warmup_urls = env_list("HARVEST_WARMUP_URLS", "HARVEST_WARMUP_URL");
        Ok(cfg.normalized())
    }

    /// Replaces zero or empty values with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        if self.request_timeout.is_zero() {
            self.request_timeout = defaults.request_timeout;
        }
        if self.user_agents.is_empty() {
            self.user_agents = defaults.user_agents;
        }
        if self.event_capacity == 0 {
            self.event_capacity = defaults.event_capacity;
        }
        if self.store_path.as_os_str().is_empty() {
            self.store_path = self.store_backend.default_path();
        }
        self
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            ..RunnerConfig::default()
        }
    }

    pub fn session_config(&self) -> HttpSessionConfig {
        HttpSessionConfig {
            user_agents: self.user_agents.clone(),
            warmup_urls: self.warmup_urls.clone(),
            timeout: self.request_timeout,
        }
    }
}
