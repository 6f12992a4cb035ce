//! In-memory object store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};
use crate::store::ObjectStore;

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    puts: HashMap<String, u32>,
    deletes: HashMap<String, u32>,
}

/// Process-local object store.
///
/// Keeps per-key put/delete counters so callers can assert how often an
/// artifact was written or removed.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `key` currently exists.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    /// Number of times `key` was written.
    pub fn put_count(&self, key: &str) -> u32 {
        self.lock().puts.get(key).copied().unwrap_or(0)
    }

    /// Number of times `key` was deleted.
    pub fn delete_count(&self, key: &str) -> u32 {
        self.lock().deletes.get(key).copied().unwrap_or(0)
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self, operation: &str) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::DownloadFailed(format!(
                "object store unavailable during {}",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.check_available("put")?;
        let mut inner = self.lock();
        inner.objects.insert(key.to_string(), data);
        *inner.puts.entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.check_available("get")?;
        self.lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_available("delete")?;
        let mut inner = self.lock();
        inner.objects.remove(key);
        *inner.deletes.entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryObjectStore::new();
        store.put("a.mp4", b"abc".to_vec()).await.unwrap();
        assert_eq!(store.get("a.mp4").await.unwrap(), b"abc");
        assert_eq!(store.put_count("a.mp4"), 1);

        assert_ok!(store.delete("a.mp4").await);
        assert!(!store.contains("a.mp4"));
        assert!(matches!(
            store.get("a.mp4").await,
            Err(StorageError::NotFound(_))
        ));
        // Deleting twice is fine but counted
        assert_ok!(store.delete("a.mp4").await);
        assert_eq!(store.delete_count("a.mp4"), 2);
    }

    #[tokio::test]
    async fn test_file_helpers() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.bin");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let store = MemoryObjectStore::new();
        store.upload_file(&src, "k").await.unwrap();

        let dst = dir.path().join("nested").join("out.bin");
        store.download_file("k", &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_unavailable_is_retryable() {
        let store = MemoryObjectStore::new();
        store.set_unavailable(true);
        let err = assert_err!(store.put("k", vec![]).await);
        assert!(err.is_retryable());
    }
}
