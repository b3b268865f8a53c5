use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::runtime::TaskShared;
use super::types::{TaskId, TaskStatus};
use crate::error::{JobError, JobResult};

/// Partial progress report from a work function. Unset fields keep their
/// current value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressUpdate {
    pub processed_items: Option<u64>,
    pub failed_items: Option<u64>,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    pub resume_state: Option<Value>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(mut self, n: u64) -> Self {
        self.processed_items = Some(n);
        self
    }

    pub fn failed(mut self, n: u64) -> Self {
        self.failed_items = Some(n);
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Job-specific cursor, stored as `custom_data` in the resume snapshot.
    pub fn resume_state(mut self, state: Value) -> Self {
        self.resume_state = Some(state);
        self
    }
}

/// Percentage of `processed` over `total`, rounded and clamped to 100.
/// `None` when there is no known total.
pub fn percent(processed: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let pct = (processed as f64 / total as f64 * 100.0).round();
    Some(pct.clamp(0.0, 100.0) as u8)
}

/// The work function's view of its task.
#[derive(Clone)]
pub struct TaskHandle {
    pub(super) shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn task_type(&self) -> &str {
        &self.shared.task_type
    }

    pub fn parameters(&self) -> &Value {
        &self.shared.parameters
    }

    /// Deserializes the task parameters into a job's own parameter type.
    pub fn parameters_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        serde_json::from_value(self.shared.parameters.clone())
            .map_err(|err| JobError::fatal(format!("invalid parameters: {}", err)))
    }

    pub fn total_items(&self) -> u64 {
        self.shared.total_items
    }

    pub fn processed_items(&self) -> u64 {
        self.shared.state.lock().processed_items
    }

    pub fn failed_items(&self) -> u64 {
        self.shared.state.lock().failed_items
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.state.lock().status
    }

    /// Must be called at least once per work unit. Blocks while the task is
    /// paused and returns [`JobError::Stopped`] once stop is requested.
    pub fn checkpoint(&self) -> JobResult<()> {
        self.shared.control.checkpoint()
    }

    /// Interruptible sleep for backoffs and pacing delays.
    pub fn sleep(&self, duration: Duration) -> JobResult<()> {
        self.shared.control.sleep(duration)
    }

    /// Writes progress through to the store before returning.
    pub fn update(&self, update: ProgressUpdate) -> JobResult<()> {
        self.shared.report(update)
    }

    /// Shorthand for a `current_step`-only update.
    pub fn step(&self, step: impl Into<String>) -> JobResult<()> {
        self.update(ProgressUpdate::new().step(step))
    }

    /// The cursor last saved through [`ProgressUpdate::resume_state`],
    /// including one recovered from a paused record.
    pub fn resume_state(&self) -> Option<Value> {
        self.shared.state.lock().cursor.clone()
    }

    pub fn resume_state_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.resume_state()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("task_type", &self.shared.task_type)
            .finish()
    }
}
