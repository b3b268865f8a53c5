use std::sync::Arc;

use harvest_engine_rs::helpers::build_task_store;
use harvest_engine_rs::task::{TaskFilter, TaskId, TaskRecord, TaskStatus, TaskStore};
use harvest_engine_rs::EngineConfig;

use crate::models::CLIConfig;

/// Read-only view over the configured task store. The store is reopened for
/// every query so rows written by a running engine process show up.
pub struct StoreClient {
    config: EngineConfig,
}

impl StoreClient {
    pub fn new(config: &CLIConfig) -> Self {
        Self {
            config: config.engine.clone(),
        }
    }

    pub fn describe(&self) -> String {
        format!("{} ({})", self.config.store_backend, self.config.store_path.display())
    }

    fn open(&self) -> Result<Arc<dyn TaskStore>, String> {
        build_task_store(&self.config).map_err(|err| err.to_string())
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<TaskRecord>, String> {
        let filter = TaskFilter {
            status,
            limit,
            ..TaskFilter::default()
        };
        self.open()?.get_tasks(&filter).map_err(|err| err.to_string())
    }

    pub fn get_task(&self, id: TaskId) -> Result<TaskRecord, String> {
        self.open()?
            .get_task(id)
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("task {} not found", id))
    }

    pub fn resumable(&self) -> Result<Vec<TaskRecord>, String> {
        self.open()?.get_resumable_tasks().map_err(|err| err.to_string())
    }
}
