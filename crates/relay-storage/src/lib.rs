use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use relay_protocol::{ActionStoragePort, ClientError, ClientResult, StoredEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, instrument, warn};

const DEFAULT_EXPIRATION_SECS: i64 = 15 * 60;

fn default_expiration() -> Duration {
    Duration::seconds(DEFAULT_EXPIRATION_SECS)
}

fn to_client_error(error: anyhow::Error) -> ClientError {
    ClientError::Storage(format!("{error:#}"))
}

/// Process-local cache. Entries vanish with the process, so it reports itself
/// as non-persistent and never activates the persisted filter.
#[derive(Debug)]
pub struct MemoryActionStorage {
    entries: Mutex<HashMap<String, StoredEntry>>,
    expiration: Duration,
}

impl Default for MemoryActionStorage {
    fn default() -> Self {
        Self::new(default_expiration())
    }
}

impl MemoryActionStorage {
    pub fn new(expiration: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiration,
        }
    }

    /// Overwrite an entry verbatim, including its timestamps.
    pub fn insert_entry(&self, key: impl Into<String>, entry: StoredEntry) {
        self.entries.lock().insert(key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ActionStoragePort for MemoryActionStorage {
    async fn get(&self, key: &str, include_expired: bool) -> ClientResult<Option<StoredEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| include_expired || !entry.is_expired())
            .cloned())
    }

    async fn put(&self, key: &str, value: Value) -> ClientResult<()> {
        self.entries
            .lock()
            .insert(key.to_owned(), StoredEntry::new(value, self.expiration));
        Ok(())
    }

    async fn remove(&self, key: &str) -> ClientResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> ClientResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    key: String,
    entry: StoredEntry,
}

/// Persistent cache with one JSON file per key under `<root>/actions`.
///
/// File names are the sha256 of the key, so arbitrary descriptor and
/// parameter text never reaches the filesystem.
#[derive(Debug)]
pub struct FileActionStorage {
    root: PathBuf,
    expiration: Duration,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileActionStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_expiration(root, default_expiration())
    }

    pub fn with_expiration(root: impl Into<PathBuf>, expiration: Duration) -> Self {
        Self {
            root: root.into(),
            expiration,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn actions_dir(&self) -> PathBuf {
        self.root.join("actions")
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.actions_dir()
            .join(format!("{}.json", hex::encode(digest)))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `key` once no other writer holds a clone of it.
    fn release_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut guard = self.write_locks.lock();
        drop(lock);
        if guard
            .get(key)
            .is_some_and(|shared| Arc::strong_count(shared) == 1)
        {
            guard.remove(key);
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.write_locks.lock().len()
    }

    async fn read_entry(path: &Path) -> Result<Option<EntryFile>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading cache entry {path:?}"))?;
        let file: EntryFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing cache entry {path:?}"))?;
        Ok(Some(file))
    }

    async fn load(&self, key: &str, include_expired: bool) -> Result<Option<StoredEntry>> {
        let path = self.entry_path(key);
        let Some(file) = Self::read_entry(&path).await? else {
            return Ok(None);
        };
        if file.key != key {
            warn!(key, stored_key = %file.key, "cache entry key mismatch");
            return Ok(None);
        }
        if !include_expired && file.entry.is_expired() {
            return Ok(None);
        }
        Ok(Some(file.entry))
    }

    async fn store(&self, key: &str, value: Value) -> Result<()> {
        let dir = self.actions_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache dir {dir:?}"))?;

        let lock = self.lock_for(key);
        let written = {
            let _guard = lock.lock().await;
            self.write_entry(key, value).await
        };
        self.release_lock(key, lock);
        written
    }

    async fn write_entry(&self, key: &str, value: Value) -> Result<()> {
        let path = self.entry_path(key);
        let file = EntryFile {
            key: key.to_owned(),
            entry: StoredEntry::new(value, self.expiration),
        };
        let bytes = serde_json::to_vec(&file).context("failed serializing cache entry")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed writing cache entry {tmp:?}"))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed moving cache entry into place {path:?}"))?;
        debug!(key, "cache entry stored");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.lock_for(key);
        let removed = {
            let _guard = lock.lock().await;
            self.remove_entry(key).await
        };
        self.release_lock(key, lock);
        removed
    }

    async fn remove_entry(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path)
                .await
                .with_context(|| format!("failed removing cache entry {path:?}"))?;
        }
        Ok(())
    }

    async fn scan_keys(&self) -> Result<Vec<String>> {
        let dir = self.actions_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut reader = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing cache dir {dir:?}"))?;
        let mut keys = Vec::new();
        while let Some(item) = reader.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(Some(file)) => keys.push(file.key),
                Ok(None) => {}
                Err(error) => warn!(path = ?path, error = %error, "skipping unreadable cache entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ActionStoragePort for FileActionStorage {
    #[instrument(skip(self))]
    async fn get(&self, key: &str, include_expired: bool) -> ClientResult<Option<StoredEntry>> {
        self.load(key, include_expired)
            .await
            .map_err(to_client_error)
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: Value) -> ClientResult<()> {
        self.store(key, value).await.map_err(to_client_error)
    }

    #[instrument(skip(self))]
    async fn remove(&self, key: &str) -> ClientResult<()> {
        self.delete(key).await.map_err(to_client_error)
    }

    async fn keys(&self) -> ClientResult<Vec<String>> {
        self.scan_keys().await.map_err(to_client_error)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
