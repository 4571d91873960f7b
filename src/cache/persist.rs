//! Durable key-value persistence for cache snapshots and usage counters.
//! One serialized blob per key. The SQLite implementation mirrors the
//! single-table, WAL-mode layout used elsewhere in the app.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

#[derive(Debug)]
pub enum PersistError {
    Database(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Database(msg) => write!(f, "database error: {msg}"),
        }
    }
}

/// Opaque blob persistence: one string value per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;
    /// Remove the key entirely so a later `get` returns None.
    async fn remove(&self, key: &str) -> Result<(), PersistError>;
}

/// SQLite-backed key-value store.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, PersistError> {
        let conn = Connection::open(db_path)
            .map_err(|e| PersistError::Database(format!("open failed: {e}")))?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| PersistError::Database(format!("PRAGMA failed: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| PersistError::Database(format!("create table failed: {e}")))?;

        info!(path = %db_path.display(), "kv store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| PersistError::Database(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_unix()],
        )
        .map_err(|e| PersistError::Database(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
            .map_err(|e| PersistError::Database(e.to_string()))?;
        Ok(())
    }
}

/// In-memory key-value store for tests and platforms without SQLite.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn sqlite_round_trip_and_remove() {
        let dir = tempdir().unwrap();
        let store = SqliteKvStore::open(&dir.path().join("test.db")).unwrap();

        assert_eq!(store.get("music_cache").await.unwrap(), None);

        store.set("music_cache", "{\"v\":1}").await.unwrap();
        assert_eq!(
            store.get("music_cache").await.unwrap().as_deref(),
            Some("{\"v\":1}")
        );

        store.set("music_cache", "{\"v\":2}").await.unwrap();
        assert_eq!(
            store.get("music_cache").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );

        store.remove("music_cache").await.unwrap();
        assert_eq!(store.get("music_cache").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryKvStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
