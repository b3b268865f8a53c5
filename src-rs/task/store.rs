use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use fs2::FileExt;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::types::{NewTask, StatusUpdate, TaskFilter, TaskId, TaskRecord, TaskStatus};
use crate::error::{StoreError, StoreResult};

/// Durable record of every task. All writes go through the operations below;
/// implementations enforce the record invariants via [`TaskRecord::apply`].
pub trait TaskStore: Send + Sync {
    fn create_task(&self, new: NewTask) -> StoreResult<TaskId>;

    fn update_task_status(&self, id: TaskId, update: StatusUpdate) -> StoreResult<TaskRecord>;

    fn get_task(&self, id: TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Newest first, at most `filter.limit` records.
    fn get_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskRecord>>;

    fn get_resumable_tasks(&self) -> StoreResult<Vec<TaskRecord>> {
        let paused = self.get_tasks(&TaskFilter {
            limit: usize::MAX,
            ..TaskFilter::status(TaskStatus::Paused)
        })?;
        Ok(paused.into_iter().filter(|t| t.can_resume).collect())
    }
}

/// Exclusive advisory lock on the sidecar `<file>.lock`, released on drop.
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Map-backed store, optionally mirrored to a JSON file after every write.
///
/// A file-backed store re-reads the file before every operation and holds
/// an exclusive lock across each read-modify-write, so several processes
/// sharing one file see each other's writes and cannot overwrite a newer
/// status with a stale one.
pub struct JsonTaskStore {
    path: Option<PathBuf>,
    next_id: AtomicI64,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl JsonTaskStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            next_id: AtomicI64::new(1),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Opens (or creates) a store persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let loaded = if path.exists() {
            Self::load_from_disk(&path)?
        } else {
            Vec::new()
        };
        let next = loaded.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        info!(path = %path.display(), tasks = loaded.len(), "opened json task store");
        Ok(Self {
            path: Some(path),
            next_id: AtomicI64::new(next),
            tasks: RwLock::new(loaded.into_iter().map(|t| (t.id, t)).collect()),
        })
    }

    pub fn load_from_disk(path: &Path) -> StoreResult<Vec<TaskRecord>> {
        let data = fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str::<Vec<TaskRecord>>(&data)?)
    }

    /// Replaces `map` with the file contents. No-op in memory or before the
    /// first write.
    fn reload(&self, map: &mut HashMap<TaskId, TaskRecord>) -> StoreResult<()> {
        match &self.path {
            Some(path) if path.exists() => {
                *map = Self::load_from_disk(path)?.into_iter().map(|t| (t.id, t)).collect();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn lock(&self) -> StoreResult<Option<FileLock>> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(None),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension("json.lock"))?;
        FileExt::lock_exclusive(&file)?;
        Ok(Some(FileLock(file)))
    }

    fn save(&self, map: &HashMap<TaskId, TaskRecord>) -> StoreResult<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut list: Vec<&TaskRecord> = map.values().collect();
        list.sort_by_key(|t| t.id);
        let serialized = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Atomic replace: readers never see a partially written file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl TaskStore for JsonTaskStore {
    fn create_task(&self, new: NewTask) -> StoreResult<TaskId> {
        let mut map = self.tasks.write();
        let _lock = self.lock()?;
        self.reload(&mut map)?;
        let after_last = map.keys().max().map_or(1, |last| last + 1);
        let id = self.next_id.load(Ordering::SeqCst).max(after_last);
        self.next_id.store(id + 1, Ordering::SeqCst);
        map.insert(id, TaskRecord::new(id, new));
        if let Err(err) = self.save(&map) {
            map.remove(&id);
            return Err(err);
        }
        debug!(task_id = id, "task record created");
        Ok(id)
    }

    fn update_task_status(&self, id: TaskId, update: StatusUpdate) -> StoreResult<TaskRecord> {
        let mut map = self.tasks.write();
        let _lock = self.lock()?;
        self.reload(&mut map)?;
        let current = map.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut next = current.clone();
        next.apply(update)?;
        let previous = map.insert(id, next.clone());
        if let Err(err) = self.save(&map) {
            if let Some(previous) = previous {
                map.insert(id, previous);
            }
            return Err(err);
        }
        Ok(next)
    }

    fn get_task(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let mut map = self.tasks.write();
        self.reload(&mut map)?;
        Ok(map.get(&id).cloned())
    }

    fn get_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskRecord>> {
        let mut map = self.tasks.write();
        self.reload(&mut map)?;
        let mut items: Vec<TaskRecord> = map.values().filter(|t| filter.matches(t)).cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        items.truncate(filter.limit);
        Ok(items)
    }
}
