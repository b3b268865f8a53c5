use std::fmt;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Error message recorded when an operator stops a task.
pub const STOPPED_BY_OPERATOR: &str = "stopped by operator";

/// Failures of the durable task store. Never recovered locally.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("illegal status transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("progress out of range for task {id}: {progress}")]
    ProgressOutOfRange { id: TaskId, progress: u8 },

    #[error("{field} would decrease for task {id}: {current} -> {requested}")]
    CounterRegression {
        id: TaskId,
        field: &'static str,
        current: u64,
        requested: u64,
    },

    #[error("{field} cannot be written with status {status} (task {id})")]
    MisplacedField {
        id: TaskId,
        field: &'static str,
        status: TaskStatus,
    },

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the control operations of the task manager.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {0} is not active")]
    NotActive(TaskId),

    #[error("task {0} does not support pause/resume")]
    NotResumable(TaskId),

    #[error("task {id} is {status}, expected {expected}")]
    WrongStatus {
        id: TaskId,
        status: TaskStatus,
        expected: &'static str,
    },

    #[error("no job registered for task type: {0}")]
    UnknownJob(String),

    #[error("failed to spawn thread for task {id}: {source}")]
    Spawn {
        id: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("task manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors a work function may return to the task boundary.
#[derive(Debug, Error)]
pub enum JobError {
    /// Cooperative cancellation. Not a fault.
    #[error("stopped by operator")]
    Stopped,

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn fatal(err: impl fmt::Display) -> Self {
        JobError::Fatal(err.to_string())
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, JobError::Stopped)
    }
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid job name")]
    InvalidName,

    #[error("job spec name mismatch: {spec} != {name}")]
    NameMismatch { name: String, spec: String },

    #[error("job already registered: {0}")]
    Duplicate(String),
}
