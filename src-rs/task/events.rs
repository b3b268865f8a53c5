use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{TaskId, TaskRecord, TaskStatus};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification published after a task write has been persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        task_id: TaskId,
        task_type: String,
        task_name: String,
    },
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    Progress {
        task_id: TaskId,
        progress: u8,
        processed_items: u64,
        failed_items: u64,
        current_step: Option<String>,
    },
    Finished {
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Created { task_id, .. }
            | TaskEvent::StatusChanged { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Finished { task_id, .. } => *task_id,
        }
    }

    /// Describes the write that moved `record` out of `previous`.
    pub fn for_write(previous: TaskStatus, record: &TaskRecord) -> TaskEvent {
        let task_id = record.id;
        if record.status.is_terminal() {
            TaskEvent::Finished {
                task_id,
                status: record.status,
                error_message: record.error_message.clone(),
            }
        } else if previous != record.status {
            TaskEvent::StatusChanged {
                task_id,
                from: previous,
                to: record.status,
            }
        } else {
            TaskEvent::Progress {
                task_id,
                progress: record.progress,
                processed_items: record.processed_items,
                failed_items: record.failed_items,
                current_step: record.current_step.clone(),
            }
        }
    }
}

/// Fan-out of [`TaskEvent`]s. Publishing never blocks; slow receivers lag.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
