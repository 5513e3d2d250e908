//! SQLite-backed cache store.

use super::storage::CacheStore;
use crate::error::{Result, TallyError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Durable store keeping one envelope row per resource key.
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TallyError::Io {
                message: format!("Failed to create cache directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| TallyError::Database {
            message: format!("Failed to open cache database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TallyError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        debug!("Opened cache database at {}", db_path.display());
        Self::with_connection(conn)
    }

    /// Non-persistent database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| TallyError::Database {
            message: format!("Failed to open in-memory database: {}", e),
            source: Some(e),
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                envelope TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| TallyError::Database {
            message: format!("Failed to initialize cache schema: {}", e),
            source: Some(e),
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| TallyError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }
}

impl CacheStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.lock()?;

        let raw: Option<String> = conn
            .query_row(
                "SELECT envelope FROM cache_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TallyError::Database {
                message: format!("Failed to query cache entry: {}", e),
                source: Some(e),
            })?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| TallyError::CacheRead {
                    key: key.to_string(),
                    message: format!("Stored envelope is not JSON: {}", e),
                }),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT OR REPLACE INTO cache_entries (key, envelope, updated_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![key, value.to_string(), now],
        )
        .map_err(|e| TallyError::Database {
            message: format!("Failed to set cache entry: {}", e),
            source: Some(e),
        })?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;

        let deleted = conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .map_err(|e| TallyError::Database {
                message: format!("Failed to delete cache entry: {}", e),
                source: Some(e),
            })?;

        Ok(deleted > 0)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare("SELECT key FROM cache_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(keys)
    }
}
