use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::info;

use super::store::TaskStore;
use super::types::{NewTask, StatusUpdate, TaskFilter, TaskId, TaskRecord, TaskStatus};
use crate::error::{StoreError, StoreResult};

const COLUMNS: &str = "id, task_type, task_name, parameters, status, progress, current_step,
    total_items, processed_items, failed_items, result_data, error_message, can_resume,
    resume_data, created_at, updated_at, started_at, completed_at";

/// SQLite-backed task store. One connection, serialized behind a mutex.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let store = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "opened sqlite task store");
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                task_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                current_step TEXT,
                total_items INTEGER NOT NULL DEFAULT 0,
                processed_items INTEGER NOT NULL DEFAULT 0,
                failed_items INTEGER NOT NULL DEFAULT 0,
                result_data TEXT,
                error_message TEXT,
                can_resume INTEGER NOT NULL DEFAULT 1,
                resume_data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type)",
            [],
        )?;
        Ok(())
    }

    fn fetch(conn: &Connection, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS);
        let raw = conn
            .query_row(&sql, params![id], RawRow::read)
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }
}

impl TaskStore for SqliteTaskStore {
    fn create_task(&self, new: NewTask) -> StoreResult<TaskId> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tasks (task_type, task_name, parameters, total_items, can_resume,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new.task_type,
                new.task_name,
                serde_json::to_string(&new.parameters)?,
                to_sql_count(new.total_items),
                new.can_resume,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(task_id = id, task_type = %new.task_type, name = %new.task_name, "task record created");
        Ok(id)
    }

    fn update_task_status(&self, id: TaskId, update: StatusUpdate) -> StoreResult<TaskRecord> {
        let conn = self.conn.lock();
        let mut record = Self::fetch(&conn, id)?.ok_or(StoreError::NotFound(id))?;
        record.apply(update)?;
        conn.execute(
            "UPDATE tasks SET
                status = ?2,
                progress = ?3,
                current_step = ?4,
                processed_items = ?5,
                failed_items = ?6,
                result_data = ?7,
                error_message = ?8,
                resume_data = ?9,
                updated_at = ?10,
                started_at = ?11,
                completed_at = ?12
             WHERE id = ?1",
            params![
                id,
                record.status.as_str(),
                record.progress,
                record.current_step,
                to_sql_count(record.processed_items),
                to_sql_count(record.failed_items),
                record.result_data.as_ref().map(Value::to_string),
                record.error_message,
                record.resume_data.as_ref().map(Value::to_string),
                record.updated_at.to_rfc3339(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(record)
    }

    fn get_task(&self, id: TaskId) -> StoreResult<Option<TaskRecord>> {
        let conn = self.conn.lock();
        Self::fetch(&conn, id)
    }

    fn get_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
            COLUMNS
        );
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![filter.status.map(|s| s.as_str()), filter.task_type, limit],
                RawRow::read,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Column values as stored, before JSON and timestamp decoding.
struct RawRow {
    id: i64,
    task_type: String,
    task_name: String,
    parameters: String,
    status: String,
    progress: i64,
    current_step: Option<String>,
    total_items: i64,
    processed_items: i64,
    failed_items: i64,
    result_data: Option<String>,
    error_message: Option<String>,
    can_resume: bool,
    resume_data: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            task_name: row.get(2)?,
            parameters: row.get(3)?,
            status: row.get(4)?,
            progress: row.get(5)?,
            current_step: row.get(6)?,
            total_items: row.get(7)?,
            processed_items: row.get(8)?,
            failed_items: row.get(9)?,
            result_data: row.get(10)?,
            error_message: row.get(11)?,
            can_resume: row.get(12)?,
            resume_data: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            started_at: row.get(16)?,
            completed_at: row.get(17)?,
        })
    }

    fn into_record(self) -> StoreResult<TaskRecord> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let progress = u8::try_from(self.progress)
            .map_err(|_| StoreError::Corrupt(format!("progress {} for task {}", self.progress, self.id)))?;
        Ok(TaskRecord {
            id: self.id,
            task_type: self.task_type,
            task_name: self.task_name,
            parameters: serde_json::from_str(&self.parameters)?,
            status,
            progress,
            current_step: self.current_step,
            total_items: from_sql_count(self.total_items),
            processed_items: from_sql_count(self.processed_items),
            failed_items: from_sql_count(self.failed_items),
            result_data: parse_json(self.result_data)?,
            error_message: self.error_message,
            can_resume: self.can_resume,
            resume_data: parse_json(self.resume_data)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_json(raw: Option<String>) -> StoreResult<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
}

fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_database_creation() {
        let dir = tempdir().unwrap();
        let store = SqliteTaskStore::open(&dir.path().join("tasks.db"));
        assert!(store.is_ok());
    }

    #[test]
    fn test_full_lifecycle_round_trip() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let id = store
            .create_task(
                NewTask::new("download_links", "journal 2020")
                    .parameters(json!({"urls": ["http://a"], "output_dir": "/tmp/x"}))
                    .total_items(1),
            )
            .unwrap();

        store
            .update_task_status(id, StatusUpdate::new(TaskStatus::Running).current_step("fetching"))
            .unwrap();
        store
            .update_task_status(
                id,
                StatusUpdate::new(TaskStatus::Completed)
                    .progress(100)
                    .counters(1, 0)
                    .result_data(json!({"succeeded": 1})),
            )
            .unwrap();

        let rec = store.get_task(id).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.current_step.as_deref(), Some("fetching"));
        assert_eq!(rec.parameters["urls"][0], "http://a");
        assert_eq!(rec.result_data, Some(json!({"succeeded": 1})));
        assert!(rec.started_at.is_some());
        assert!(rec.completed_at.is_some());
    }

    #[test]
    fn test_invalid_transition_is_not_written() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let id = store.create_task(NewTask::new("t", "n")).unwrap();
        assert!(store
            .update_task_status(id, StatusUpdate::new(TaskStatus::Paused))
            .is_err());
        assert_eq!(store.get_task(id).unwrap().unwrap().status, TaskStatus::Pending);
        assert!(store.get_task(42).unwrap().is_none());
    }

    #[test]
    fn test_filters_and_resumable() {
        let store = SqliteTaskStore::in_memory().unwrap();
        let resumable = store.create_task(NewTask::new("download_links", "a")).unwrap();
        let fixed = store
            .create_task(NewTask::new("download_links", "b").can_resume(false))
            .unwrap();
        let other = store.create_task(NewTask::new("search", "c")).unwrap();
        for id in [resumable, fixed] {
            store
                .update_task_status(id, StatusUpdate::new(TaskStatus::Running))
                .unwrap();
            store
                .update_task_status(
                    id,
                    StatusUpdate::new(TaskStatus::Paused).resume_data(json!({"processed_items": 0})),
                )
                .unwrap();
        }

        let all = store.get_tasks(&TaskFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, other);

        let typed = store
            .get_tasks(&TaskFilter {
                task_type: Some("download_links".to_string()),
                limit: 1,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(typed.len(), 1);

        let ids: Vec<TaskId> = store.get_resumable_tasks().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![resumable]);
    }
}
