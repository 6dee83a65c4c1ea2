//! Archive schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Bring the schema up to date. Safe to run on every open.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            file_path TEXT NOT NULL,
            file_type TEXT NOT NULL,
            metadata TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_message TEXT,
            result TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            last_updated TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_completed_at ON tasks(completed_at);
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    run_processing_duration_migration(conn)?;

    Ok(())
}

/// Migration: record how long the last conversion attempt took
fn run_processing_duration_migration(conn: &Connection) -> ServiceResult<()> {
    let has_duration: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('tasks') WHERE name='processing_duration_ms'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0)
        > 0;

    if !has_duration {
        conn.execute_batch("ALTER TABLE tasks ADD COLUMN processing_duration_ms INTEGER;")
            .map_err(|e| DatabaseError::Migration {
                message: format!("Failed to add processing_duration_ms column: {}", e),
            })?;
    }

    Ok(())
}
