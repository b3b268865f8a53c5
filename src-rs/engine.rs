use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::helpers::{build_session_factory, build_task_store};
use crate::jobs::{register_builtin, JobRegistry, JobSpec};
use crate::session::{ChallengeDetector, SessionFactory};
use crate::task::{
    EventBus, NewTask, ShutdownReport, TaskEvent, TaskId, TaskManager, TaskRecord, TaskRegistry, TaskStore,
    WorkFn,
};
use crate::units::RunnerConfig;

/// One process lifetime of the engine: configuration, task store, task
/// manager and the jobs tasks can be bound to.
pub struct Engine {
    config: EngineConfig,
    manager: TaskManager,
    jobs: JobRegistry,
}

impl Engine {
    /// Opens the configured store and registers the built-in jobs against
    /// HTTP sessions.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let config = config.normalized();
        let store = build_task_store(&config)?;
        let factory = build_session_factory(&config);
        let runner = config.runner_config();
        Self::with_parts(config, store, factory, runner)
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        factory: Arc<dyn SessionFactory>,
        runner: RunnerConfig,
    ) -> EngineResult<Self> {
        let config = config.normalized();
        let manager = TaskManager::new(
            store,
            Arc::new(TaskRegistry::new()),
            EventBus::new(config.event_capacity),
            config.poll_interval,
        );
        let jobs = JobRegistry::new();
        let detector = ChallengeDetector::new(config.challenge_markers.clone());
        register_builtin(&jobs, factory, runner, detector)?;
        info!(backend = %config.store_backend, jobs = jobs.count(), "engine ready");
        Ok(Self { config, manager, jobs })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.manager.subscribe()
    }

    pub fn register_job(&self, name: &str, handler: WorkFn, spec: JobSpec) -> EngineResult<()> {
        Ok(self.jobs.register(name, handler, spec)?)
    }

    /// Creates a task for the job named by `new.task_type` and starts it.
    /// A job registered as non-resumable forces `can_resume` off. A task
    /// that cannot be started is failed and dropped from the registry.
    pub fn submit(&self, mut new: NewTask) -> EngineResult<TaskId> {
        let work = self
            .jobs
            .get(&new.task_type)
            .ok_or_else(|| EngineError::UnknownJob(new.task_type.clone()))?;
        if self.jobs.spec(&new.task_type).is_some_and(|spec| !spec.can_resume) {
            new.can_resume = false;
        }
        let id = self.manager.create_task(new, work)?;
        if let Err(err) = self.manager.start_task(id) {
            if let Err(cleanup) = self.manager.stop_task(id) {
                warn!(task_id = id, error = %cleanup, "failed to discard unstarted task");
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Re-arms a paused task with the work function registered for its
    /// type and starts it again.
    pub fn resume(&self, id: TaskId) -> EngineResult<()> {
        let record = self.manager.get_task(id)?.ok_or(EngineError::NotFound(id))?;
        let work = self
            .jobs
            .get(&record.task_type)
            .ok_or_else(|| EngineError::UnknownJob(record.task_type.clone()))?;
        self.manager.resume_task(id, work)?;
        self.manager.start_task(id)?;
        info!(task_id = id, processed = record.processed_items, "task resumed");
        Ok(())
    }

    pub fn pause(&self, id: TaskId) -> EngineResult<()> {
        self.manager.pause_task(id)
    }

    /// Stops the task, failing its record directly when no task object for
    /// it lives in this process.
    pub fn stop(&self, id: TaskId) -> EngineResult<()> {
        match self.manager.stop_task(id) {
            Err(EngineError::NotActive(_)) => self.manager.stop_inactive(id),
            other => other,
        }
    }

    pub fn task(&self, id: TaskId) -> EngineResult<Option<TaskRecord>> {
        self.manager.get_task(id)
    }

    pub fn shutdown(&self) -> ShutdownReport {
        self.manager.shutdown()
    }
}
