//! Durable storage boundary and the timestamped cache envelope.

use crate::clock::elapsed_between;
use crate::error::{Result, TallyError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key/value store holding one JSON envelope per resource key.
///
/// All operations are synchronous to match rusqlite's API.
pub trait CacheStore: Send + Sync {
    /// Get the stored envelope for a key.
    fn read(&self, key: &str) -> Result<Option<Value>>;

    /// Store an envelope, replacing any existing one.
    fn write(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool>;

    /// All stored keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Shared store handle.
pub type DynStore = Arc<dyn CacheStore>;

/// A cached value with the time it was fetched and its freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub fetched_at: DateTime<Utc>,
    /// Stored in milliseconds.
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, value: T, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            fetched_at,
            ttl,
        }
    }

    /// Age of the entry at `now` (zero if `now` precedes `fetched_at`).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.fetched_at, now)
    }
}

/// An entry is expired once its age reaches the TTL.
pub fn is_expired<T>(entry: &CacheEntry<T>, now: DateTime<Utc>) -> bool {
    entry.age(now) >= entry.ttl
}

/// Decode the envelope stored under `key`.
pub fn read_entry<T: DeserializeOwned>(
    store: &dyn CacheStore,
    key: &str,
) -> Result<Option<CacheEntry<T>>> {
    let Some(raw) = store.read(key)? else {
        return Ok(None);
    };

    serde_json::from_value(raw)
        .map(Some)
        .map_err(|e| TallyError::CacheRead {
            key: key.to_string(),
            message: format!("Invalid cache envelope: {}", e),
        })
}

/// Encode and store an envelope under its key.
pub fn write_entry<T: Serialize>(store: &dyn CacheStore, entry: &CacheEntry<T>) -> Result<()> {
    let raw = serde_json::to_value(entry).map_err(|e| TallyError::CacheWrite {
        key: entry.key.clone(),
        message: format!("Failed to encode cache envelope: {}", e),
    })?;
    store.write(&entry.key, &raw)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &Value) -> Result<()> {
        self.lock().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
