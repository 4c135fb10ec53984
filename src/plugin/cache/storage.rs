//! Cache backing stores.
//!
//! A store maps cache keys to [`StorageValue`]s. Lookups take an optional
//! TTL: with `None` the entry is returned whatever its age, with `Some(ttl)`
//! an entry older than `ttl` comes back as an `empty` marker, which the
//! cache plugin treats as a miss.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheStoreError;

/// Freshness of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageState {
    /// Fresh entry.
    Cached,
    /// Entry kept past its freshness window.
    Stale,
    /// No usable data.
    Empty,
}

/// A cached response with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageValue {
    /// Freshness of the entry.
    pub state: StorageState,
    /// The cached response.
    #[serde(default)]
    pub data: Value,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: i64,
    /// TTL the entry was stored with, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl StorageValue {
    /// A fresh entry created now.
    pub fn cached(data: Value, ttl: Duration) -> Self {
        Self {
            state: StorageState::Cached,
            data,
            created_at: now_millis(),
            ttl: Some(duration_millis(ttl)),
        }
    }

    /// The miss marker.
    pub fn empty() -> Self {
        Self {
            state: StorageState::Empty,
            data: Value::Null,
            created_at: now_millis(),
            ttl: None,
        }
    }

    /// Whether this value can answer a call.
    pub fn is_hit(&self) -> bool {
        self.state != StorageState::Empty
    }

    /// Whether the entry is older than `ttl` at `now` (milliseconds).
    pub fn is_expired_at(&self, ttl: Duration, now: i64) -> bool {
        let age = now.saturating_sub(self.created_at);
        age > i64::try_from(duration_millis(ttl)).unwrap_or(i64::MAX)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Apply lookup-TTL semantics to a raw entry.
fn resolve(entry: Option<&StorageValue>, ttl: Option<Duration>) -> Option<StorageValue> {
    let entry = entry?;
    match ttl {
        Some(ttl) if entry.is_expired_at(ttl, now_millis()) => Some(StorageValue::empty()),
        _ => Some(entry.clone()),
    }
}

/// Key/value store behind the cache plugin.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Look up `key`. `ttl: None` ignores expiry.
    async fn get(&self, key: &str, ttl: Option<Duration>)
        -> Result<Option<StorageValue>, CacheStoreError>;

    /// Store `data` under `key` as a fresh entry.
    async fn set(&self, key: &str, data: Value, ttl: Duration) -> Result<(), CacheStoreError>;

    /// Remove one entry.
    async fn remove(&self, key: &str) -> Result<(), CacheStoreError>;

    /// Remove every entry.
    async fn clear(&self) -> Result<(), CacheStoreError>;
}

/// In-memory store. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, StorageValue>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a raw entry, metadata included.
    pub fn insert(&self, key: &str, value: StorageValue) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(key.to_string(), value);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn get(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<StorageValue>, CacheStoreError> {
        let entries = self.entries.lock().expect("cache lock poisoned");
        Ok(resolve(entries.get(key), ttl))
    }

    async fn set(&self, key: &str, data: Value, ttl: Duration) -> Result<(), CacheStoreError> {
        self.insert(key, StorageValue::cached(data, ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheStoreError> {
        self.entries.lock().expect("cache lock poisoned").remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries.lock().expect("cache lock poisoned").clear();
        Ok(())
    }
}

/// Store persisted as a single JSON file.
///
/// Entries live in memory and the whole map is rewritten on every change,
/// with owner-only permissions on Unix.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: tokio::sync::Mutex<HashMap<String, StorageValue>>,
}

impl FileStorage {
    /// Open the store at `path`, loading existing entries. A missing file
    /// is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheStoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };
        log::debug!(
            "[FileStorage] Loaded {} entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Put a raw entry, metadata included.
    pub async fn insert(&self, key: &str, value: StorageValue) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    async fn persist(&self, entries: &HashMap<String, StorageValue>) -> Result<(), CacheStoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, contents).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for FileStorage {
    async fn get(
        &self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<StorageValue>, CacheStoreError> {
        let entries = self.entries.lock().await;
        Ok(resolve(entries.get(key), ttl))
    }

    async fn set(&self, key: &str, data: Value, ttl: Duration) -> Result<(), CacheStoreError> {
        self.insert(key, StorageValue::cached(data, ttl)).await
    }

    async fn remove(&self, key: &str) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.persist(&entries).await
    }
}
