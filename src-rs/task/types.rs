use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::{StoreError, StoreResult};

pub type TaskId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Edges of the lifecycle state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Pending)
                | (Pending, Failed)
                | (Paused, Failed)
        )
    }

    /// Whether a write carrying `next` is legal: either a transition or a
    /// progress write that keeps a non-terminal status.
    pub fn accepts(self, next: TaskStatus) -> bool {
        (self == next && !self.is_terminal()) || self.can_transition_to(next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Durable record of one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub task_name: String,
    pub parameters: Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub resume_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: TaskId, new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_type: new.task_type,
            task_name: new.task_name,
            parameters: new.parameters,
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            total_items: new.total_items,
            processed_items: 0,
            failed_items: 0,
            result_data: None,
            error_message: None,
            can_resume: new.can_resume,
            resume_data: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies one status write, enforcing the record invariants. Every store
    /// backend funnels its updates through here.
    pub fn apply(&mut self, update: StatusUpdate) -> StoreResult<()> {
        let next = update.status;
        if !self.status.accepts(next) {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        if let Some(progress) = update.progress {
            if progress > 100 {
                return Err(StoreError::ProgressOutOfRange {
                    id: self.id,
                    progress,
                });
            }
        }
        check_counter(self.id, "processed_items", self.processed_items, update.processed_items)?;
        check_counter(self.id, "failed_items", self.failed_items, update.failed_items)?;
        if update.result_data.is_some() && next != TaskStatus::Completed {
            return Err(self.misplaced("result_data", next));
        }
        if update.error_message.is_some() && next != TaskStatus::Failed {
            return Err(self.misplaced("error_message", next));
        }
        if update.resume_data.is_some() && next != TaskStatus::Paused {
            return Err(self.misplaced("resume_data", next));
        }

        let now = Utc::now();
        let transition = self.status != next;

        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(step) = update.current_step {
            self.current_step = Some(step);
        }
        if let Some(processed) = update.processed_items {
            self.processed_items = processed;
        }
        if let Some(failed) = update.failed_items {
            self.failed_items = failed;
        }
        if let Some(resume) = update.resume_data {
            self.resume_data = Some(resume);
        }

        match next {
            TaskStatus::Paused if self.resume_data.is_none() => {
                self.resume_data = Some(json!({}));
            }
            TaskStatus::Completed => {
                self.result_data = Some(update.result_data.unwrap_or_else(|| json!({})));
            }
            TaskStatus::Failed => {
                self.error_message =
                    Some(update.error_message.unwrap_or_else(|| "unknown error".to_string()));
            }
            _ => {}
        }

        if transition && next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if transition && next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    fn misplaced(&self, field: &'static str, status: TaskStatus) -> StoreError {
        StoreError::MisplacedField {
            id: self.id,
            field,
            status,
        }
    }
}

fn check_counter(id: TaskId, field: &'static str, current: u64, requested: Option<u64>) -> StoreResult<()> {
    match requested {
        Some(requested) if requested < current => Err(StoreError::CounterRegression {
            id,
            field,
            current,
            requested,
        }),
        _ => Ok(()),
    }
}

/// Fields supplied when a task is first persisted.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub task_type: String,
    pub task_name: String,
    pub parameters: Value,
    pub total_items: u64,
    pub can_resume: bool,
}

impl NewTask {
    pub fn new(task_type: &str, task_name: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            task_name: task_name.to_string(),
            parameters: json!({}),
            total_items: 0,
            can_resume: true,
        }
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn total_items(mut self, total_items: u64) -> Self {
        self.total_items = total_items;
        self
    }

    pub fn can_resume(mut self, can_resume: bool) -> Self {
        self.can_resume = can_resume;
        self
    }
}

/// One write to a task record. `status` is always present; every other field
/// is left untouched when `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub processed_items: Option<u64>,
    pub failed_items: Option<u64>,
    pub error_message: Option<String>,
    pub result_data: Option<Value>,
    pub resume_data: Option<Value>,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            current_step: None,
            processed_items: None,
            failed_items: None,
            error_message: None,
            result_data: None,
            resume_data: None,
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn counters(mut self, processed: u64, failed: u64) -> Self {
        self.processed_items = Some(processed);
        self.failed_items = Some(failed);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn result_data(mut self, data: Value) -> Self {
        self.result_data = Some(data);
        self
    }

    pub fn resume_data(mut self, data: Value) -> Self {
        self.resume_data = Some(data);
        self
    }
}

#[derive(Clone, Debug)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            limit: 100,
        }
    }
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .task_type
                .as_deref()
                .map_or(true, |t| record.task_type == t)
    }
}

/// Shape of `resume_data`: the counters at pause time plus whatever cursor
/// the work function last saved.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    pub processed_items: u64,
    pub failed_items: u64,
    pub current_step: Option<String>,
    pub custom_data: Option<Value>,
}

impl ResumeSnapshot {
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        value.and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}
