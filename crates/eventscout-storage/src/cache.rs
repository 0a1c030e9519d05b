//! Cache-aside TTL store. Backends hold raw JSON entries; [`CacheStore`] adds typing,
//! lazy expiry and the fail-open policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(payload: String, stored_at: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let expires_at = stored_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            payload,
            stored_at,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;
    async fn remove(&self, key: &str) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().await.clear();
        Ok(())
    }
}

/// One JSON file per key, addressed by the SHA-256 of the key.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", Self::sha256_hex(key.as_bytes())))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
        move |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }

    /// Write to a temp file in the same directory, then rename over the entry.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(Self::io_err(&self.root))?;

        let path = self.entry_path(key);
        let bytes = serde_json::to_vec(&entry)?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(Self::io_err(&temp_path))?;
        file.write_all(&bytes)
            .await
            .map_err(Self::io_err(&temp_path))?;
        file.flush().await.map_err(Self::io_err(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(&path)(err));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_err(&path)(err)),
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Self::io_err(&self.root)(err)),
        };
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(Self::io_err(&self.root))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                fs::remove_file(&path).await.map_err(Self::io_err(&path))?;
            }
        }
        Ok(())
    }
}

/// A decoded cache hit with its timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Typed, fail-open facade over a [`CacheBackend`]. Backend errors read as
/// misses and failed writes are logged and dropped.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore").finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileCache::new(root)))
    }

    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<Cached<T>> {
        let entry = match self.backend.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };

        if entry.is_expired_at(Utc::now()) {
            debug!(key, expired_at = %entry.expires_at, "evicting expired cache entry");
            if let Err(err) = self.backend.remove(key).await {
                warn!(key, error = %err, "failed to evict expired cache entry");
            }
            return None;
        }

        match serde_json::from_str::<T>(&entry.payload) {
            Ok(value) => Some(Cached {
                value,
                stored_at: entry.stored_at,
                expires_at: entry.expires_at,
            }),
            Err(err) => {
                warn!(key, error = %err, "undecodable cache payload; treating as miss");
                None
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|c| c.value)
    }

    /// Age of a live entry; `None` when absent, expired or unreadable.
    pub async fn entry_age(&self, key: &str) -> Option<Duration> {
        self.get_entry::<serde_json::Value>(key)
            .await
            .map(|c| c.age_at(Utc::now()))
    }

    /// Returns whether the value reached the backend.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "could not serialize cache value");
                return false;
            }
        };
        match self
            .backend
            .set(key, CacheEntry::new(payload, Utc::now(), ttl))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(key, error = %err, "cache write failed; continuing without cache");
                false
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(err) = self.backend.remove(key).await {
            warn!(key, error = %err, "cache invalidate failed");
        }
    }

    pub async fn invalidate_all(&self) {
        if let Err(err) = self.backend.clear().await {
            warn!(error = %err, "cache clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _entry: CacheEntry) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn clear(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = CacheStore::in_memory();
        assert!(cache.set("events", &vec!["a", "b"], Duration::from_secs(60)).await);
        let got: Option<Vec<String>> = cache.get("events").await;
        assert_eq!(got, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss_and_is_evicted() {
        let backend = Arc::new(MemoryCache::new());
        let cache = CacheStore::new(backend.clone());
        cache.set("events", &vec![1, 2, 3], Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get::<Vec<u32>>("events").await, None);
        assert!(backend.get("events").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_ttl_is_immediately_stale() {
        let cache = CacheStore::in_memory();
        cache.set("k", &1u8, Duration::ZERO).await;
        assert_eq!(cache.get::<u8>("k").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_single_key_and_all() {
        let cache = CacheStore::in_memory();
        cache.set("a", &1u8, Duration::from_secs(60)).await;
        cache.set("b", &2u8, Duration::from_secs(60)).await;
        cache.invalidate("a").await;
        assert_eq!(cache.get::<u8>("a").await, None);
        assert_eq!(cache.get::<u8>("b").await, Some(2));
        cache.invalidate_all().await;
        assert_eq!(cache.get::<u8>("b").await, None);
    }

    #[tokio::test]
    async fn backend_failures_fail_open() {
        let cache = CacheStore::new(Arc::new(BrokenBackend));
        assert!(!cache.set("events", &vec![1], Duration::from_secs(60)).await);
        assert_eq!(cache.get::<Vec<u8>>("events").await, None);
        assert_eq!(cache.entry_age("events").await, None);
        cache.invalidate("events").await;
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_miss() {
        let cache = CacheStore::in_memory();
        cache.set("events", &"not a list", Duration::from_secs(60)).await;
        assert_eq!(cache.get::<Vec<u8>>("events").await, None);
    }

    #[tokio::test]
    async fn entry_age_tracks_store_time() {
        let cache = CacheStore::in_memory();
        assert_eq!(cache.entry_age("refugee_count").await, None);
        cache.set("refugee_count", &42u64, Duration::from_secs(60)).await;
        let age = cache.entry_age("refugee_count").await.unwrap();
        assert!(age < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn file_cache_round_trips_and_clears() {
        let dir = tempdir().expect("tempdir");
        let backend = FileCache::new(dir.path().join("cache"));
        let cache = CacheStore::new(Arc::new(backend.clone()));

        assert!(cache.set("events", &vec!["x"], Duration::from_secs(60)).await);
        assert!(backend.entry_path("events").exists());
        assert_eq!(cache.get::<Vec<String>>("events").await, Some(vec!["x".to_string()]));

        cache.invalidate_all().await;
        assert!(!backend.entry_path("events").exists());
        assert_eq!(cache.get::<Vec<String>>("events").await, None);
    }

    #[tokio::test]
    async fn file_cache_corrupt_entry_is_a_miss() {
        let dir = tempdir().expect("tempdir");
        let backend = FileCache::new(dir.path());
        std::fs::write(backend.entry_path("events"), b"{not json").unwrap();
        let cache = CacheStore::new(Arc::new(backend));
        assert_eq!(cache.get::<Vec<String>>("events").await, None);
    }

    #[test]
    fn key_hashing_is_stable() {
        assert_eq!(
            FileCache::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
