use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rule_engine::{KeyValueStore, StoreError};

// ================================================================================================
// SQLITE SCHEMA
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);
";

// ================================================================================================
// STORE
// ================================================================================================

/// Durable key-value store on a single SQLite table.
///
/// Values are stored as JSON text; each `set` replaces the whole value
/// (last writer wins).
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create storage directory: {}", e))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| format!("Failed to open SQLite database: {}", e))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("Failed to open SQLite database: {}", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to create schema: {}", e))?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of keys written so far
    pub fn len(&self) -> Result<usize, String> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(|e| format!("Count failed: {}", e))
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = {
            let conn = self.db.lock();
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                .optional()
                .map_err(|e| StoreError::Read {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?
        };

        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|e| StoreError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let text = value.to_string();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, Utc::now().timestamp_millis()],
        )
        .map(|_| ())
        .map_err(|e| StoreError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}
