use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::control::TaskControl;
use super::events::{EventBus, TaskEvent};
use super::handle::{percent, ProgressUpdate, TaskHandle};
use super::store::TaskStore;
use super::types::{ResumeSnapshot, StatusUpdate, TaskId, TaskRecord, TaskStatus};
use crate::error::{
    EngineError, EngineResult, JobError, JobResult, StoreError, StoreResult, STOPPED_BY_OPERATOR,
};

/// A work function: runs one task to completion on its execution thread.
pub type WorkFn = Arc<dyn Fn(&TaskHandle) -> JobResult<Value> + Send + Sync>;

/// In-memory mirror of the last persisted write.
#[derive(Debug)]
pub(super) struct Progress {
    pub(super) status: TaskStatus,
    pub(super) progress: u8,
    pub(super) processed_items: u64,
    pub(super) failed_items: u64,
    pub(super) current_step: Option<String>,
    pub(super) cursor: Option<Value>,
}

impl Progress {
    fn snapshot(&self) -> Value {
        ResumeSnapshot {
            processed_items: self.processed_items,
            failed_items: self.failed_items,
            current_step: self.current_step.clone(),
            custom_data: self.cursor.clone(),
        }
        .to_value()
    }
}

/// State shared between a [`Task`] and the handle its work function sees.
///
/// Every store write for the task happens with `state` locked, so writes for
/// one task id are totally ordered.
pub(super) struct TaskShared {
    pub(super) id: TaskId,
    pub(super) task_type: String,
    pub(super) task_name: String,
    pub(super) parameters: Value,
    pub(super) total_items: u64,
    pub(super) can_resume: bool,
    pub(super) control: TaskControl,
    pub(super) state: Mutex<Progress>,
    store: Arc<dyn TaskStore>,
    events: EventBus,
}

impl TaskShared {
    fn persist(&self, state: &mut MutexGuard<'_, Progress>, update: StatusUpdate) -> StoreResult<TaskRecord> {
        let previous = state.status;
        let record = self.store.update_task_status(self.id, update)?;
        state.status = record.status;
        state.progress = record.progress;
        self.events.publish(TaskEvent::for_write(previous, &record));
        Ok(record)
    }

    pub(super) fn report(&self, update: ProgressUpdate) -> JobResult<()> {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            // Only stop finalizes a task behind its worker's back.
            return Err(JobError::Stopped);
        }
        let processed = update.processed_items.unwrap_or(state.processed_items);
        let failed = update.failed_items.unwrap_or(state.failed_items);
        let progress = update
            .progress
            .map(|p| p.min(100))
            .or_else(|| percent(processed, self.total_items))
            .unwrap_or(state.progress);

        let mut write = StatusUpdate::new(state.status)
            .progress(progress)
            .counters(processed, failed);
        if let Some(step) = &update.current_step {
            write = write.current_step(step.clone());
        }

        let cursor = update.resume_state.or_else(|| state.cursor.clone());
        if state.status == TaskStatus::Paused {
            let pending = Progress {
                status: state.status,
                progress,
                processed_items: processed,
                failed_items: failed,
                current_step: update.current_step.clone().or_else(|| state.current_step.clone()),
                cursor: cursor.clone(),
            };
            write = write.resume_data(pending.snapshot());
        }

        match self.persist(&mut state, write) {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                // Finalized behind this process's back, e.g. stopped from another process.
                state.status = from;
                info!(task_id = self.id, status = %from, "task finalized elsewhere");
                return Err(JobError::Stopped);
            }
            Err(err) => return Err(err.into()),
        }
        state.processed_items = processed;
        state.failed_items = failed;
        if update.current_step.is_some() {
            state.current_step = update.current_step;
        }
        state.cursor = cursor;
        Ok(())
    }

    fn finish_failed(&self, message: String) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        let write = StatusUpdate::new(TaskStatus::Failed)
            .counters(state.processed_items, state.failed_items)
            .error_message(message.clone());
        match self.persist(&mut state, write) {
            Ok(_) => warn!(task_id = self.id, error = %message, "task failed"),
            Err(err) => error!(task_id = self.id, error = %err, "failed to record task failure"),
        }
    }

    /// Persists `completed` once the task is running. A task paused after its
    /// last checkpoint waits here until it is released or stopped.
    fn complete(&self, result: Value) {
        loop {
            if let Err(err) = self.control.checkpoint() {
                debug!(task_id = self.id, "stopped while finishing");
                self.finish_failed(err.to_string());
                return;
            }
            let mut state = self.state.lock();
            match state.status {
                TaskStatus::Running => {
                    let write = StatusUpdate::new(TaskStatus::Completed)
                        .progress(100)
                        .counters(state.processed_items, state.failed_items)
                        .result_data(result);
                    match self.persist(&mut state, write) {
                        Ok(_) => info!(task_id = self.id, name = %self.task_name, "task completed"),
                        Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                            state.status = from;
                            info!(task_id = self.id, status = %from, "task finalized elsewhere");
                        }
                        Err(err) => {
                            error!(task_id = self.id, error = %err, "failed to record completion")
                        }
                    }
                    return;
                }
                status if status.is_terminal() => return,
                _ => {
                    drop(state);
                    // Pause may be persisted a moment before its flag is raised.
                    if self.control.sleep(self.control.poll_interval()).is_err() {
                        self.finish_failed(STOPPED_BY_OPERATOR.to_string());
                        return;
                    }
                }
            }
        }
    }
}

fn run(shared: Arc<TaskShared>, work: WorkFn) {
    let handle = TaskHandle {
        shared: Arc::clone(&shared),
    };
    info!(task_id = shared.id, task_type = %shared.task_type, "task thread started");
    match panic::catch_unwind(AssertUnwindSafe(|| work(&handle))) {
        Ok(Ok(result)) => shared.complete(result),
        Ok(Err(JobError::Stopped)) => {
            info!(task_id = shared.id, "task stopped");
            shared.finish_failed(STOPPED_BY_OPERATOR.to_string());
        }
        Ok(Err(err)) => shared.finish_failed(err.to_string()),
        Err(payload) => {
            shared.finish_failed(format!("work function panicked: {}", panic_message(payload.as_ref())))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What `stop` left behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// No worker thread existed; the task is fully finalized.
    Finalized,
    /// The failure is recorded; the worker exits at its next checkpoint.
    Signalled,
}

/// One supervised execution unit: a task record, its work function and the
/// thread running it.
pub struct Task {
    shared: Arc<TaskShared>,
    work: WorkFn,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn new(
        record: &TaskRecord,
        work: WorkFn,
        store: Arc<dyn TaskStore>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        let snapshot = ResumeSnapshot::from_value(record.resume_data.as_ref());
        let shared = TaskShared {
            id: record.id,
            task_type: record.task_type.clone(),
            task_name: record.task_name.clone(),
            parameters: record.parameters.clone(),
            total_items: record.total_items,
            can_resume: record.can_resume,
            control: TaskControl::new(poll_interval),
            state: Mutex::new(Progress {
                status: record.status,
                progress: record.progress,
                processed_items: record.processed_items,
                failed_items: record.failed_items,
                current_step: record.current_step.clone(),
                cursor: snapshot.and_then(|s| s.custom_data),
            }),
            store,
            events,
        };
        Self {
            shared: Arc::new(shared),
            work,
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn task_type(&self) -> &str {
        &self.shared.task_type
    }

    pub fn can_resume(&self) -> bool {
        self.shared.can_resume
    }

    pub fn status(&self) -> TaskStatus {
        self.shared.state.lock().status
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Moves a pending task to running. Spawns the worker thread on first
    /// start and releases a parked worker afterwards. `on_exit` runs on the
    /// worker thread once the final status is persisted.
    pub fn start<F>(&self, on_exit: F) -> EngineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.status != TaskStatus::Pending {
            return Err(EngineError::WrongStatus {
                id: self.shared.id,
                status: state.status,
                expected: "pending",
            });
        }
        let mut worker = self.worker.lock();
        self.shared
            .persist(&mut state, StatusUpdate::new(TaskStatus::Running))?;

        if worker.is_some() {
            self.shared.control.release();
            info!(task_id = self.shared.id, "task resumed on parked worker");
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let work = Arc::clone(&self.work);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", self.shared.id))
            .spawn(move || {
                run(shared, work);
                on_exit();
            });
        match spawned {
            Ok(join) => {
                *worker = Some(join);
                Ok(())
            }
            Err(source) => {
                let write = StatusUpdate::new(TaskStatus::Failed)
                    .error_message(format!("failed to spawn task thread: {}", source));
                self.shared.persist(&mut state, write)?;
                Err(EngineError::Spawn {
                    id: self.shared.id,
                    source,
                })
            }
        }
    }

    /// Persists `paused` with a resume snapshot, then parks the worker at its
    /// next checkpoint.
    pub fn pause(&self) -> EngineResult<()> {
        if !self.shared.can_resume {
            return Err(EngineError::NotResumable(self.shared.id));
        }
        let mut state = self.shared.state.lock();
        if state.status != TaskStatus::Running {
            return Err(EngineError::WrongStatus {
                id: self.shared.id,
                status: state.status,
                expected: "running",
            });
        }
        let write = StatusUpdate::new(TaskStatus::Paused)
            .counters(state.processed_items, state.failed_items)
            .resume_data(state.snapshot());
        self.shared.persist(&mut state, write)?;
        self.shared.control.request_pause();
        info!(task_id = self.shared.id, processed = state.processed_items, "task paused");
        Ok(())
    }

    /// Paused to pending, ready for the next `start`.
    pub fn rearm(&self) -> EngineResult<()> {
        let mut state = self.shared.state.lock();
        if state.status != TaskStatus::Paused {
            return Err(EngineError::WrongStatus {
                id: self.shared.id,
                status: state.status,
                expected: "paused",
            });
        }
        self.shared
            .persist(&mut state, StatusUpdate::new(TaskStatus::Pending))?;
        debug!(task_id = self.shared.id, "task re-armed");
        Ok(())
    }

    /// Records `failed` with the operator-stop message and signals the worker.
    pub fn stop(&self) -> EngineResult<StopOutcome> {
        let mut state = self.shared.state.lock();
        if state.status.is_terminal() {
            return Err(EngineError::WrongStatus {
                id: self.shared.id,
                status: state.status,
                expected: "pending, running or paused",
            });
        }
        let write = StatusUpdate::new(TaskStatus::Failed)
            .counters(state.processed_items, state.failed_items)
            .error_message(STOPPED_BY_OPERATOR);
        self.shared.persist(&mut state, write)?;
        self.shared.control.request_stop();
        info!(task_id = self.shared.id, "task stopped by operator");
        if self.worker.lock().is_some() {
            Ok(StopOutcome::Signalled)
        } else {
            Ok(StopOutcome::Finalized)
        }
    }

    /// Takes the worker's join handle, if any. Used when draining.
    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("task_type", &self.shared.task_type)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{JsonTaskStore, NewTask};
    use serde_json::json;
    use std::sync::mpsc;

    fn fixture(total: u64, can_resume: bool, work: WorkFn) -> (Arc<JsonTaskStore>, Task) {
        let store = Arc::new(JsonTaskStore::in_memory());
        let id = store
            .create_task(NewTask::new("test", "runtime").total_items(total).can_resume(can_resume))
            .unwrap();
        let record = store.get_task(id).unwrap().unwrap();
        let dyn_store: Arc<dyn TaskStore> = store.clone();
        let task = Task::new(&record, work, dyn_store, EventBus::default(), Duration::from_millis(5));
        (store, task)
    }

    fn finished(store: &JsonTaskStore, id: TaskId) -> TaskRecord {
        for _ in 0..400 {
            let rec = store.get_task(id).unwrap().unwrap();
            if rec.status.is_terminal() {
                return rec;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("task {} did not finish", id);
    }

    #[test]
    fn completes_with_full_progress() {
        let work: WorkFn = Arc::new(|h: &TaskHandle| -> JobResult<Value> {
            for i in 1..=4 {
                h.checkpoint()?;
                h.update(ProgressUpdate::new().processed(i))?;
            }
            Ok(json!({"done": true}))
        });
        let (store, task) = fixture(4, true, work);
        let (tx, rx) = mpsc::channel();
        task.start(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let rec = finished(&store, task.id());
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.processed_items, 4);
        assert_eq!(rec.result_data, Some(json!({"done": true})));
    }

    #[test]
    fn errors_and_panics_become_failed() {
        let work: WorkFn = Arc::new(|h: &TaskHandle| -> JobResult<Value> {
            h.update(ProgressUpdate::new().processed(1).failed(1))?;
            Err(JobError::fatal("source unreachable"))
        });
        let (store, task) = fixture(3, true, work);
        task.start(|| {}).unwrap();
        let rec = finished(&store, task.id());
        assert_eq!(rec.error_message.as_deref(), Some("source unreachable"));
        assert_eq!(rec.failed_items, 1);

        let work: WorkFn = Arc::new(|_: &TaskHandle| -> JobResult<Value> { panic!("bad unit") });
        let (store, task) = fixture(0, true, work);
        task.start(|| {}).unwrap();
        let rec = finished(&store, task.id());
        assert_eq!(rec.status, TaskStatus::Failed);
        assert!(rec.error_message.unwrap().contains("bad unit"));
    }

    #[test]
    fn stop_before_start_finalizes_immediately() {
        let work: WorkFn = Arc::new(|_: &TaskHandle| -> JobResult<Value> { Ok(json!({})) });
        let (store, task) = fixture(1, true, work);
        assert_eq!(task.stop().unwrap(), StopOutcome::Finalized);
        let rec = store.get_task(task.id()).unwrap().unwrap();
        assert_eq!(rec.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
        assert!(task.start(|| {}).is_err());
    }

    #[test]
    fn pause_requires_resumable_running_task() {
        let work: WorkFn = Arc::new(|h: &TaskHandle| -> JobResult<Value> {
            loop {
                h.checkpoint()?;
                thread::sleep(Duration::from_millis(2));
            }
        });
        let (_store, task) = fixture(0, false, work.clone());
        assert!(matches!(task.pause(), Err(EngineError::NotResumable(_))));

        let (store, task) = fixture(0, true, work);
        assert!(matches!(task.pause(), Err(EngineError::WrongStatus { .. })));
        task.start(|| {}).unwrap();
        task.pause().unwrap();
        let rec = store.get_task(task.id()).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Paused);
        assert!(rec.resume_data.is_some());

        assert_eq!(task.stop().unwrap(), StopOutcome::Signalled);
        let rec = finished(&store, task.id());
        assert_eq!(rec.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
    }

    #[test]
    fn parked_worker_resumes_after_rearm() {
        let work: WorkFn = Arc::new(|h: &TaskHandle| -> JobResult<Value> {
            for i in 1..=40 {
                h.checkpoint()?;
                h.update(ProgressUpdate::new().processed(i))?;
                thread::sleep(Duration::from_millis(5));
            }
            Ok(json!({}))
        });
        let (store, task) = fixture(40, true, work);
        task.start(|| {}).unwrap();
        thread::sleep(Duration::from_millis(10));
        task.pause().unwrap();
        let paused_at = store.get_task(task.id()).unwrap().unwrap().processed_items;

        task.rearm().unwrap();
        task.start(|| {}).unwrap();
        let rec = finished(&store, task.id());
        assert_eq!(rec.status, TaskStatus::Completed);
        assert!(rec.processed_items >= paused_at);
        assert_eq!(rec.processed_items, 40);
    }
}
