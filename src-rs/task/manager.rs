use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::events::{EventBus, TaskEvent};
use super::runtime::{StopOutcome, Task, WorkFn};
use super::store::TaskStore;
use super::types::{NewTask, StatusUpdate, TaskFilter, TaskId, TaskRecord, TaskStatus};
use crate::error::{EngineError, EngineResult, STOPPED_BY_OPERATOR};

/// Tasks with a live in-memory object in this process.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Arc<Task>) {
        self.tasks.write().insert(task.id(), task);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.write().remove(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

/// Outcome of [`TaskManager::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub paused: Vec<TaskId>,
    pub stopped: Vec<TaskId>,
    pub errors: Vec<(TaskId, String)>,
}

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    events: EventBus,
    poll_interval: Duration,
    shutting_down: AtomicBool,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            poll_interval,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Persists a pending record and registers its task. Does not start it.
    pub fn create_task(&self, new: NewTask, work: WorkFn) -> EngineResult<TaskId> {
        let id = self.store.create_task(new)?;
        let record = self.store.get_task(id)?.ok_or(EngineError::NotFound(id))?;
        self.register(&record, work);
        self.events.publish(TaskEvent::Created {
            task_id: id,
            task_type: record.task_type.clone(),
            task_name: record.task_name.clone(),
        });
        info!(task_id = id, task_type = %record.task_type, name = %record.task_name, "task created");
        Ok(id)
    }

    fn register(&self, record: &TaskRecord, work: WorkFn) -> Arc<Task> {
        let task = Arc::new(Task::new(
            record,
            work,
            Arc::clone(&self.store),
            self.events.clone(),
            self.poll_interval,
        ));
        self.registry.insert(Arc::clone(&task));
        task
    }

    pub fn start_task(&self, id: TaskId) -> EngineResult<()> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let task = self.registry.get(id).ok_or(EngineError::NotFound(id))?;
        let registry = Arc::downgrade(&self.registry);
        task.start(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }

    pub fn pause_task(&self, id: TaskId) -> EngineResult<()> {
        let task = self.registry.get(id).ok_or(EngineError::NotActive(id))?;
        task.pause()
    }

    pub fn stop_task(&self, id: TaskId) -> EngineResult<()> {
        let task = self.registry.get(id).ok_or(EngineError::NotActive(id))?;
        if task.stop()? == StopOutcome::Finalized {
            self.registry.remove(id);
        }
        Ok(())
    }

    /// Fails a non-terminal record that has no task object in this process,
    /// including one left `running` by a crashed process. Active tasks are
    /// stopped normally.
    pub fn stop_inactive(&self, id: TaskId) -> EngineResult<()> {
        if self.registry.contains(id) {
            return self.stop_task(id);
        }
        let record = self.store.get_task(id)?.ok_or(EngineError::NotFound(id))?;
        match record.status {
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused => {
                let update = StatusUpdate::new(TaskStatus::Failed)
                    .error_message(STOPPED_BY_OPERATOR);
                let stored = self.store.update_task_status(id, update)?;
                self.events.publish(TaskEvent::for_write(record.status, &stored));
                info!(task_id = id, "inactive task stopped");
                Ok(())
            }
            status => Err(EngineError::WrongStatus {
                id,
                status,
                expected: "pending, running or paused",
            }),
        }
    }

    /// Re-arms a paused, resumable task to pending. A task still active in
    /// this process keeps its parked worker; otherwise `work` is bound to a
    /// fresh task object that starts from the recorded counters.
    pub fn resume_task(&self, id: TaskId, work: WorkFn) -> EngineResult<()> {
        let record = self.store.get_task(id)?.ok_or(EngineError::NotFound(id))?;
        if record.status != TaskStatus::Paused {
            return Err(EngineError::WrongStatus {
                id,
                status: record.status,
                expected: "paused",
            });
        }
        if !record.can_resume {
            return Err(EngineError::NotResumable(id));
        }
        if let Some(task) = self.registry.get(id) {
            return task.rearm();
        }
        let task = self.register(&record, work);
        if let Err(err) = task.rearm() {
            self.registry.remove(id);
            return Err(err);
        }
        info!(task_id = id, processed = record.processed_items, "task restored from store");
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> EngineResult<Option<TaskRecord>> {
        Ok(self.store.get_task(id)?)
    }

    pub fn get_all_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        self.get_tasks(&TaskFilter::default())
    }

    pub fn get_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<TaskRecord>> {
        Ok(self.store.get_tasks(filter)?)
    }

    pub fn get_resumable_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        Ok(self.store.get_resumable_tasks()?)
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        self.registry.ids()
    }

    /// Drops registry entries whose task already reached a terminal status.
    pub fn cleanup_finished_tasks(&self) -> usize {
        let mut removed = 0;
        for task in self.registry.snapshot() {
            if task.status().is_terminal() {
                self.registry.remove(task.id());
                removed += 1;
            }
        }
        removed
    }

    /// Pauses every running task, stopping those that cannot be paused, and
    /// refuses further starts.
    pub fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut report = ShutdownReport::default();
        for task in self.registry.snapshot() {
            if task.status() != TaskStatus::Running {
                continue;
            }
            let id = task.id();
            let outcome = if task.can_resume() {
                task.pause().map(|_| report.paused.push(id))
            } else {
                task.stop().map(|outcome| {
                    if outcome == StopOutcome::Finalized {
                        self.registry.remove(id);
                    }
                    report.stopped.push(id);
                })
            };
            if let Err(err) = outcome {
                error!(task_id = id, error = %err, "shutdown could not settle task");
                report.errors.push((id, err.to_string()));
            }
        }
        report.paused.sort_unstable();
        report.stopped.sort_unstable();
        info!(
            paused = report.paused.len(),
            stopped = report.stopped.len(),
            "task manager shut down"
        );
        report
    }

    /// Polls the store until the task is no longer running or `timeout`
    /// elapses, returning the last record seen.
    pub fn wait_until_settled(&self, id: TaskId, timeout: Duration) -> EngineResult<TaskRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.store.get_task(id)?.ok_or(EngineError::NotFound(id))?;
            if record.status != TaskStatus::Running || Instant::now() >= deadline {
                if record.status == TaskStatus::Running {
                    warn!(task_id = id, "task still running after wait");
                }
                return Ok(record);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::task::{JsonTaskStore, ProgressUpdate, TaskHandle};
    use serde_json::{json, Value};

    fn manager() -> TaskManager {
        TaskManager::new(
            Arc::new(JsonTaskStore::in_memory()),
            Arc::new(TaskRegistry::new()),
            EventBus::default(),
            Duration::from_millis(5),
        )
    }

    fn counting_job(delay_ms: u64) -> WorkFn {
        Arc::new(move |h: &TaskHandle| -> JobResult<Value> {
            let start = h.processed_items();
            for i in start..h.total_items() {
                h.checkpoint()?;
                thread::sleep(Duration::from_millis(delay_ms));
                h.update(ProgressUpdate::new().processed(i + 1))?;
            }
            Ok(json!({"processed": h.processed_items()}))
        })
    }

    fn wait_terminal(manager: &TaskManager, id: TaskId) -> TaskRecord {
        for _ in 0..600 {
            let rec = manager.get_task(id).unwrap().unwrap();
            if rec.status.is_terminal() {
                return rec;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("task {} never finished", id);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let manager = manager();
        assert!(matches!(manager.start_task(5), Err(EngineError::NotFound(5))));
        assert!(matches!(manager.pause_task(5), Err(EngineError::NotActive(5))));
        assert!(matches!(manager.stop_task(5), Err(EngineError::NotActive(5))));
        assert!(matches!(manager.stop_inactive(5), Err(EngineError::NotFound(5))));
        assert!(matches!(
            manager.resume_task(5, counting_job(0)),
            Err(EngineError::NotFound(5))
        ));
    }

    #[test]
    fn finished_tasks_leave_the_registry() {
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("count", "ten").total_items(10), counting_job(0))
            .unwrap();
        assert_eq!(manager.active_ids(), vec![id]);
        manager.start_task(id).unwrap();
        let rec = wait_terminal(&manager, id);
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.processed_items, 10);
        for _ in 0..100 {
            if manager.active_ids().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(manager.active_ids().is_empty());
    }

    #[test]
    fn stop_of_pending_task_fails_it_without_running() {
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("count", "never"), counting_job(0))
            .unwrap();
        manager.stop_task(id).unwrap();
        let rec = manager.get_task(id).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
        assert!(manager.active_ids().is_empty());
        assert!(matches!(manager.stop_task(id), Err(EngineError::NotActive(_))));
        assert!(matches!(
            manager.stop_inactive(id),
            Err(EngineError::WrongStatus { .. })
        ));
    }

    #[test]
    fn orphaned_running_record_can_be_stopped() {
        let manager = manager();
        let id = manager.store().create_task(NewTask::new("count", "orphan")).unwrap();
        manager
            .store()
            .update_task_status(id, StatusUpdate::new(TaskStatus::Running))
            .unwrap();
        assert!(matches!(manager.stop_task(id), Err(EngineError::NotActive(_))));
        manager.stop_inactive(id).unwrap();
        let rec = manager.get_task(id).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
    }

    #[test]
    fn resume_rejects_wrong_status_and_non_resumable() {
        let manager = manager();
        let id = manager
            .create_task(NewTask::new("count", "pending"), counting_job(0))
            .unwrap();
        assert!(matches!(
            manager.resume_task(id, counting_job(0)),
            Err(EngineError::WrongStatus { .. })
        ));

        let fixed = manager
            .create_task(
                NewTask::new("count", "fixed").total_items(50).can_resume(false),
                counting_job(5),
            )
            .unwrap();
        manager.start_task(fixed).unwrap();
        assert!(matches!(
            manager.pause_task(fixed),
            Err(EngineError::NotResumable(_))
        ));
        manager.stop_task(fixed).unwrap();
        let rec = wait_terminal(&manager, fixed);
        assert_eq!(rec.status, TaskStatus::Failed);
    }

    #[test]
    fn shutdown_pauses_resumable_and_stops_the_rest() {
        let manager = manager();
        let resumable = manager
            .create_task(NewTask::new("count", "a").total_items(200), counting_job(5))
            .unwrap();
        let fixed = manager
            .create_task(
                NewTask::new("count", "b").total_items(200).can_resume(false),
                counting_job(5),
            )
            .unwrap();
        let idle = manager
            .create_task(NewTask::new("count", "c").total_items(1), counting_job(0))
            .unwrap();
        manager.start_task(resumable).unwrap();
        manager.start_task(fixed).unwrap();

        let report = manager.shutdown();
        assert_eq!(report.paused, vec![resumable]);
        assert_eq!(report.stopped, vec![fixed]);
        assert!(report.errors.is_empty());

        assert_eq!(
            manager.get_task(resumable).unwrap().unwrap().status,
            TaskStatus::Paused
        );
        assert_eq!(wait_terminal(&manager, fixed).status, TaskStatus::Failed);
        assert!(matches!(
            manager.start_task(idle),
            Err(EngineError::ShuttingDown)
        ));
        assert_eq!(manager.get_resumable_tasks().unwrap().len(), 1);
    }

    #[test]
    fn events_follow_the_lifecycle() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let id = manager
            .create_task(NewTask::new("count", "events").total_items(2), counting_job(0))
            .unwrap();
        manager.start_task(id).unwrap();

        let mut seen = Vec::new();
        loop {
            let event = rx.blocking_recv().unwrap();
            let done = matches!(event, TaskEvent::Finished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(matches!(seen.first(), Some(TaskEvent::Created { .. })));
        assert!(matches!(
            seen.last(),
            Some(TaskEvent::Finished { status: TaskStatus::Completed, .. })
        ));
        assert!(seen.iter().all(|e| e.task_id() == id));
    }
}
