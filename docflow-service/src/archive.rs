//! Durable record of task state.
//!
//! The scheduler keeps tasks in memory; an archive receives batches of
//! changed records from the status flusher. [`SqliteTaskArchive`] is the
//! built-in implementation.

mod migrations;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{DatabaseError, ServiceError, ServiceResult};
use crate::task::{ConversionOutput, FileType, Metadata, Task, TaskStatus};

/// Sink for drained task records
pub trait TaskArchive: Send + Sync {
    /// Upsert every task in `tasks`. Either all rows are written or none.
    fn persist(&self, tasks: &[Task]) -> ServiceResult<()>;
}

/// SQLite-backed task archive
pub struct SqliteTaskArchive {
    conn: Mutex<Connection>,
}

impl SqliteTaskArchive {
    /// Open or create the archive at the given path
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(DatabaseError::Query)?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory archive, mostly for tests
    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load an archived task by ID
    pub fn load_task(&self, task_id: &str) -> ServiceResult<Option<Task>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, file_path, file_type, metadata, priority, retry_count, status, \
                 error_message, result, processing_duration_ms, created_at, started_at, \
                 completed_at, last_updated FROM tasks WHERE id = ?1",
                params![task_id],
                TaskRow::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        row.map(TaskRow::into_task).transpose()
    }

    /// Number of archived tasks
    pub fn count(&self) -> ServiceResult<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .map_err(DatabaseError::Query)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl TaskArchive for SqliteTaskArchive {
    fn persist(&self, tasks: &[Task]) -> ServiceResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO tasks (id, file_path, file_type, metadata, priority, retry_count, \
                     status, error_message, result, processing_duration_ms, created_at, started_at, \
                     completed_at, last_updated) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                     ON CONFLICT(id) DO UPDATE SET \
                     priority = excluded.priority, retry_count = excluded.retry_count, \
                     status = excluded.status, error_message = excluded.error_message, \
                     result = excluded.result, processing_duration_ms = excluded.processing_duration_ms, \
                     started_at = excluded.started_at, completed_at = excluded.completed_at, \
                     last_updated = excluded.last_updated",
                )
                .map_err(DatabaseError::Query)?;

            for task in tasks {
                let metadata =
                    serde_json::to_string(&task.metadata).map_err(DatabaseError::Serialization)?;
                let result = task
                    .result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(DatabaseError::Serialization)?;
                let duration_ms = task
                    .processing_duration_ms
                    .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX));

                stmt.execute(params![
                    task.id,
                    task.file_path.to_string_lossy(),
                    task.file_type.as_str(),
                    metadata,
                    task.priority,
                    task.retry_count,
                    task.status.as_str(),
                    task.error_message,
                    result,
                    duration_ms,
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.completed_at.map(|t| t.to_rfc3339()),
                    task.last_updated.to_rfc3339(),
                ])
                .map_err(DatabaseError::Query)?;
            }
        }
        tx.commit().map_err(DatabaseError::Query)?;

        debug!(count = tasks.len(), "Archived task records");
        Ok(())
    }
}

/// Raw column values of one `tasks` row
struct TaskRow {
    id: String,
    file_path: String,
    file_type: String,
    metadata: Option<String>,
    priority: i32,
    retry_count: u32,
    status: String,
    error_message: Option<String>,
    result: Option<String>,
    processing_duration_ms: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    last_updated: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_path: row.get(1)?,
            file_type: row.get(2)?,
            metadata: row.get(3)?,
            priority: row.get(4)?,
            retry_count: row.get(5)?,
            status: row.get(6)?,
            error_message: row.get(7)?,
            result: row.get(8)?,
            processing_duration_ms: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
            last_updated: row.get(13)?,
        })
    }

    fn into_task(self) -> ServiceResult<Task> {
        let file_type = FileType::from_str(&self.file_type)
            .map_err(|_| corrupt(format!("unknown file type '{}'", self.file_type)))?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|_| corrupt(format!("unknown status '{}'", self.status)))?;
        let metadata: Metadata = match self.metadata {
            Some(json) => serde_json::from_str(&json).map_err(DatabaseError::Serialization)?,
            None => Metadata::new(),
        };
        let result: Option<ConversionOutput> = self
            .result
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        Ok(Task {
            id: self.id,
            file_path: self.file_path.into(),
            file_type,
            metadata,
            priority: self.priority,
            retry_count: self.retry_count,
            status,
            error_message: self.error_message,
            result,
            processing_duration_ms: self
                .processing_duration_ms
                .and_then(|ms| u64::try_from(ms).ok()),
            created_at: parse_timestamp(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            last_updated: parse_timestamp(&self.last_updated)?,
        })
    }
}

fn parse_timestamp(value: &str) -> ServiceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("bad timestamp '{value}': {e}")))
}

fn corrupt(message: String) -> ServiceError {
    ServiceError::Database(DatabaseError::Query(rusqlite::Error::InvalidColumnType(
        0,
        message,
        rusqlite::types::Type::Text,
    )))
}
