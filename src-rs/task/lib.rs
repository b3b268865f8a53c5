pub mod control;
pub mod events;
pub mod handle;
pub mod manager;
pub mod runtime;
pub mod sqlite;
pub mod store;
pub mod types;

pub use control::{TaskControl, DEFAULT_POLL_INTERVAL};
pub use events::{EventBus, TaskEvent};
pub use handle::{percent, ProgressUpdate, TaskHandle};
pub use manager::{ShutdownReport, TaskManager, TaskRegistry};
pub use runtime::{StopOutcome, Task, WorkFn};
pub use sqlite::SqliteTaskStore;
pub use store::{JsonTaskStore, TaskStore};
pub use types::{
    NewTask, ResumeSnapshot, StatusUpdate, TaskFilter, TaskId, TaskRecord, TaskStatus, UnknownStatus,
};
