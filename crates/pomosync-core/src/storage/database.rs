//! SQLite-backed local store.
//!
//! Provides persistent storage for:
//! - Key-value application state (timer snapshot, mutation queue, server facts)
//! - Completed session history

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::{data_dir, LocalStore};
use crate::error::StorageError;
use crate::events::CompletedSession;

/// SQLite database for local state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at `~/.config/pomosync/pomosync.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    pub fn open() -> Result<Self, StorageError> {
        Self::open_at(data_dir()?.join("pomosync.db"))
    }

    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        self.lock()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_history (
                session_id  TEXT PRIMARY KEY,
                mode        TEXT NOT NULL,
                started_at  TEXT NOT NULL,
                ended_at    TEXT NOT NULL,
                record_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_session_history_ended_at ON session_history(ended_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn kv_get(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get::<_, String>(0)
    })
    .optional()
}

fn kv_set(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

impl LocalStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(kv_get(&*self.lock()?, key)?)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Ok(kv_set(&*self.lock()?, key, value)?)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let next = apply(kv_get(&tx, key)?)?;
        kv_set(&tx, key, &next)?;
        tx.commit()?;
        Ok(next)
    }

    fn put_batch(&self, entries: &[(&str, String)]) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            kv_set(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_completed(&self, record: &CompletedSession) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO session_history (session_id, mode, started_at, ended_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.mode.as_str(),
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                json,
            ],
        )?;
        Ok(())
    }

    fn recent_completed(&self, limit: usize) -> Result<Vec<CompletedSession>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM session_history
             ORDER BY ended_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }
}
