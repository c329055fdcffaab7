use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::CheckpointStore;
use crate::domain::Checkpoint;
use crate::error::CheckpointError;

const CREATE_TABLES: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=FULL;
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_key  TEXT PRIMARY KEY,
    watermark       TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
"#;

/// `SQLite`-backed checkpoints. A single upsert statement is the commit.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, CheckpointError> {
        self.conn.lock().map_err(|_| CheckpointError::LockPoisoned)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT watermark FROM checkpoints WHERE checkpoint_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn update(&self, key: &str, value: &str) -> Result<(), CheckpointError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoints (checkpoint_key, watermark, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(checkpoint_key) DO UPDATE SET watermark=excluded.watermark, updated_at=excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT checkpoint_key, watermark, updated_at FROM checkpoints ORDER BY checkpoint_key",
        )?;
        let rows = stmt.query_map([], |row| {
            let updated_at: String = row.get(2)?;
            Ok(Checkpoint {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
