// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory storage backend for Lexis.
//
// Stands in for a host-provided key-value namespace (browser local storage,
// app preferences, ...). An optional byte quota mimics the host refusing
// writes once its allowance is used up.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::backend::StorageBackend;
use crate::error::StorageError;

#[derive(Debug, Default)]
struct MemoryState {
    data: BTreeMap<String, Vec<u8>>,
    quota: Option<u64>,
}

impl MemoryState {
    fn used_bytes(&self) -> u64 {
        self.data
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    fn insert(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            let previous = self
                .data
                .get(key)
                .map(|v| (key.len() + v.len()) as u64)
                .unwrap_or(0);
            let requested = self.used_bytes() - previous + (key.len() + value.len()) as u64;
            if requested > quota {
                return Err(StorageError::QuotaExceeded { requested, quota });
            }
        }
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// An in-memory storage backend backed by a sorted `BTreeMap`.
///
/// Clones share the same underlying map, so a test can keep one handle to
/// inspect what the engine wrote through another.
///
/// # Example
///
/// ```rust
/// use lexis_storage::memory::InMemoryBackend;
/// use lexis_storage::backend::StorageBackend;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryBackend::new();
/// store.put("lexis_vocabulary", b"{}").await.unwrap();
/// assert!(store.contains("lexis_vocabulary"));
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryBackend {
    /// Create a new, empty backend with no quota.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that refuses writes once `quota` bytes (keys plus
    /// values) would be exceeded.
    pub fn with_quota(quota: u64) -> Self {
        let backend = Self::new();
        backend.set_quota(Some(quota));
        backend
    }

    /// Change (or remove) the byte quota. Existing data is kept even if it
    /// already exceeds the new quota.
    pub fn set_quota(&self, quota: Option<u64>) {
        self.state.write().quota = quota;
    }

    /// Return the number of keys currently stored.
    pub fn len(&self) -> usize {
        self.state.read().data.len()
    }

    /// Return true if the store contains no keys.
    pub fn is_empty(&self) -> bool {
        self.state.read().data.is_empty()
    }

    /// Return true if a blob is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.state.read().data.contains_key(key)
    }

    /// Return a copy of the raw blob under `key`, bypassing the async API.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().data.get(key).cloned()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state.read().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.state.write().insert(key, value)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.state.write().data.remove(key).is_some())
    }

    fn put_blocking(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.state.write().insert(key, value)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        // All writes are immediately visible.
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }

    async fn approximate_size(&self) -> Result<Option<u64>, StorageError> {
        Ok(Some(self.state.read().used_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_crud() {
        let backend = InMemoryBackend::new();

        assert!(backend.is_empty());
        assert_eq!(backend.get("ns_settings").await.unwrap(), None);

        backend.put("ns_settings", b"v1").await.unwrap();
        assert_eq!(backend.get("ns_settings").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.len(), 1);

        // Overwrite keeps a single key.
        backend.put("ns_settings", b"v2").await.unwrap();
        assert_eq!(backend.raw("ns_settings"), Some(b"v2".to_vec()));
        assert_eq!(backend.len(), 1);

        assert!(backend.delete("ns_settings").await.unwrap());
        assert!(!backend.delete("ns_settings").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_quota_rejects_oversized_write() {
        let backend = InMemoryBackend::with_quota(10);

        // "k" + 5 bytes = 6, fits.
        backend.put("k", b"12345").await.unwrap();

        // A second key would bring the total to 6 + 1 + 5 = 12.
        let err = backend.put("j", b"12345").await.unwrap_err();
        match err {
            StorageError::QuotaExceeded { requested, quota } => {
                assert_eq!(requested, 12);
                assert_eq!(quota, 10);
            }
            other => panic!("expected QuotaExceeded, got: {:?}", other),
        }
        assert!(!backend.contains("j"));
    }

    #[tokio::test]
    async fn test_quota_accounts_for_overwrite() {
        let backend = InMemoryBackend::with_quota(10);
        backend.put("k", b"123456789").await.unwrap();
        // Replacing the value frees the old bytes first.
        backend.put("k", b"987654321").await.unwrap();
        assert_eq!(backend.raw("k"), Some(b"987654321".to_vec()));
    }

    #[tokio::test]
    async fn test_lifting_quota_allows_retry() {
        let backend = InMemoryBackend::with_quota(4);
        assert!(backend.put("key", b"long value").await.is_err());
        backend.set_quota(None);
        backend.put("key", b"long value").await.unwrap();
    }

    #[test]
    fn test_put_blocking_outside_runtime() {
        let backend = InMemoryBackend::new();
        backend.put_blocking("ns_userProgress", b"{}").unwrap();
        assert!(backend.contains("ns_userProgress"));
    }

    #[tokio::test]
    async fn test_approximate_size() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.approximate_size().await.unwrap(), Some(0));
        backend.put("abc", b"defgh").await.unwrap(); // 3 + 5
        assert_eq!(backend.approximate_size().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let backend = InMemoryBackend::new();
        let clone = backend.clone();
        backend.put("shared", b"data").await.unwrap();
        assert_eq!(clone.get("shared").await.unwrap(), Some(b"data".to_vec()));
        assert_eq!(clone.name(), "in-memory");
    }
}
