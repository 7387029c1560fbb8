// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Persistence engine.
//!
//! Each persistent collection is stored as one blob under
//! `"<namespace>_<collection>"`: the JSON entry map, optionally wrapped by
//! the configured [`Compressor`]. Flushing is split in two so the store
//! manager can encode under its state lock and write outside it:
//!
//! 1. [`PersistenceEngine::prepare`] encodes a dirty collection into a
//!    [`FlushJob`] stamped with the collection's generation.
//! 2. [`PersistenceEngine::flush`] writes the job to the backend.
//!
//! The dirty flag is cleared afterwards only if the generation still
//! matches, so mutations that land while a write is in flight are picked up
//! by the next flush.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use lexis_storage::StorageBackend;

use crate::collection::Collection;
use crate::compression::Compressor;
use crate::entry::{decode_entries, encode_entries, Entry};
use crate::error::PersistError;
use crate::sync::SyncOperation;

/// An encoded collection waiting to be written.
#[derive(Debug, Clone)]
pub struct FlushJob {
    pub collection: String,
    pub generation: u64,
    pub bytes: Vec<u8>,
}

/// Serializes collections to a [`StorageBackend`] and restores them.
pub struct PersistenceEngine<B: StorageBackend> {
    backend: Arc<B>,
    namespace: String,
    compressor: Arc<dyn Compressor>,
}

impl<B: StorageBackend> PersistenceEngine<B> {
    pub fn new(backend: Arc<B>, namespace: &str, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
            compressor,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Deterministic storage key for a collection.
    pub fn storage_key(&self, collection: &str) -> String {
        format!("{}_{}", self.namespace, collection)
    }

    fn sync_queue_key(&self) -> String {
        format!("{}__syncQueue", self.namespace)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}__syncDeadLetters", self.namespace)
    }

    /// Encode an entry map, wrapping it when `compress` is set.
    pub fn encode(
        &self,
        entries: &BTreeMap<String, Entry>,
        compress: bool,
    ) -> Result<Vec<u8>, PersistError> {
        let plain = encode_entries(entries)?;
        Ok(if compress {
            self.compressor.compress(&plain)
        } else {
            plain
        })
    }

    /// Decode a stored blob. A blob in the other format (plain where packed
    /// was expected, or the reverse) is accepted too, so collections survive
    /// a change of their `compress` flag.
    pub fn decode(
        &self,
        bytes: &[u8],
        compressed: bool,
    ) -> Result<BTreeMap<String, Entry>, PersistError> {
        let unpack = |bytes: &[u8]| {
            self.compressor
                .decompress(bytes)
                .and_then(|plain| decode_entries(&plain))
        };

        let primary = if compressed {
            unpack(bytes)
        } else {
            decode_entries(bytes)
        };

        primary.or_else(|first| {
            let alternate = if compressed {
                decode_entries(bytes)
            } else {
                unpack(bytes)
            };
            alternate.map_err(|_| first)
        })
    }

    /// Encode `collection` if it is persistent and dirty.
    pub fn prepare(&self, collection: &Collection) -> Result<Option<FlushJob>, PersistError> {
        if !collection.config().persistent || !collection.is_dirty() {
            return Ok(None);
        }
        let bytes = self.encode(collection.entries(), collection.config().compress)?;
        Ok(Some(FlushJob {
            collection: collection.name().to_string(),
            generation: collection.generation(),
            bytes,
        }))
    }

    /// Write a prepared job and ask the backend to make it durable.
    #[instrument(skip(self, job), fields(collection = %job.collection, bytes = job.bytes.len()))]
    pub async fn flush(&self, job: &FlushJob) -> Result<(), PersistError> {
        let key = self.storage_key(&job.collection);
        self.backend.put(&key, &job.bytes).await?;
        self.backend.flush().await?;
        debug!(key = %key, "Collection flushed");
        Ok(())
    }

    /// Write a prepared job without suspending (teardown path).
    pub fn flush_blocking(&self, job: &FlushJob) -> Result<(), PersistError> {
        let key = self.storage_key(&job.collection);
        self.backend.put_blocking(&key, &job.bytes)?;
        Ok(())
    }

    /// Read a collection's durable copy.
    ///
    /// A missing or undecodable copy yields `Ok(None)`; the latter is
    /// logged and treated as absent. A backend failure is returned so the
    /// caller can retry instead of mistaking the collection for empty.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        collection: &str,
        compressed: bool,
    ) -> Result<Option<BTreeMap<String, Entry>>, PersistError> {
        let key = self.storage_key(collection);
        let Some(bytes) = self.backend.get(&key).await? else {
            return Ok(None);
        };

        match self.decode(&bytes, compressed) {
            Ok(entries) => {
                debug!(key = %key, entries = entries.len(), "Collection loaded");
                Ok(Some(entries))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable persisted collection");
                Ok(None)
            }
        }
    }

    fn encode_ops(ops: &[SyncOperation]) -> Result<Vec<u8>, PersistError> {
        serde_json::to_vec(ops).map_err(PersistError::Encode)
    }

    /// Persist the pending sync operations and the dead letters.
    pub async fn save_sync_state(
        &self,
        pending: &[SyncOperation],
        dead_letters: &[SyncOperation],
    ) -> Result<(), PersistError> {
        self.backend
            .put(&self.sync_queue_key(), &Self::encode_ops(pending)?)
            .await?;
        self.backend
            .put(&self.dead_letter_key(), &Self::encode_ops(dead_letters)?)
            .await?;
        Ok(())
    }

    pub fn save_sync_state_blocking(
        &self,
        pending: &[SyncOperation],
        dead_letters: &[SyncOperation],
    ) -> Result<(), PersistError> {
        self.backend
            .put_blocking(&self.sync_queue_key(), &Self::encode_ops(pending)?)?;
        self.backend
            .put_blocking(&self.dead_letter_key(), &Self::encode_ops(dead_letters)?)?;
        Ok(())
    }

    async fn load_ops(&self, key: &str) -> Result<Vec<SyncOperation>, PersistError> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "Discarding undecodable sync operations");
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    /// Restore the pending sync operations and dead letters saved by an
    /// earlier process, as `(pending, dead_letters)`.
    pub async fn load_sync_state(
        &self,
    ) -> Result<(Vec<SyncOperation>, Vec<SyncOperation>), PersistError> {
        let pending = self.load_ops(&self.sync_queue_key()).await?;
        let dead_letters = self.load_ops(&self.dead_letter_key()).await?;
        Ok((pending, dead_letters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionConfig;
    use crate::compression::Base64Compressor;
    use async_trait::async_trait;
    use lexis_storage::{InMemoryBackend, StorageError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(backend: &InMemoryBackend) -> PersistenceEngine<InMemoryBackend> {
        PersistenceEngine::new(Arc::new(backend.clone()), "lexis", Arc::new(Base64Compressor))
    }

    fn collection(compress: bool) -> Collection {
        let config = CollectionConfig {
            compress,
            ..Default::default()
        };
        let mut coll = Collection::configure("settings", config);
        coll.write("volume", Entry::new(json!(0.8), 1, 0)).unwrap();
        coll
    }

    #[test]
    fn test_storage_key_pattern() {
        let pe = engine(&InMemoryBackend::new());
        assert_eq!(pe.storage_key("userProgress"), "lexis_userProgress");
    }

    #[test]
    fn test_prepare_skips_clean_and_memory_only() {
        let pe = engine(&InMemoryBackend::new());
        let clean = Collection::configure("settings", CollectionConfig::default());
        assert!(pe.prepare(&clean).unwrap().is_none());

        let mut scratch = Collection::configure(
            "scratch",
            CollectionConfig {
                persistent: false,
                ..Default::default()
            },
        );
        scratch.write("k", Entry::new(json!(1), 0, 0)).unwrap();
        assert!(pe.prepare(&scratch).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_then_load() {
        let backend = InMemoryBackend::new();
        let pe = engine(&backend);
        let coll = collection(false);

        let job = pe.prepare(&coll).unwrap().unwrap();
        assert_eq!(job.generation, coll.generation());
        pe.flush(&job).await.unwrap();

        let loaded = pe.load("settings", false).await.unwrap().unwrap();
        assert_eq!(&loaded, coll.entries());
    }

    #[tokio::test]
    async fn test_compressed_blob_is_not_plain_json() {
        let backend = InMemoryBackend::new();
        let pe = engine(&backend);
        let job = pe.prepare(&collection(true)).unwrap().unwrap();
        pe.flush(&job).await.unwrap();

        let raw = backend.raw("lexis_settings").unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());
        assert!(pe.load("settings", true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_tolerates_format_mismatch() {
        let backend = InMemoryBackend::new();
        let pe = engine(&backend);

        // Written plain, read as compressed.
        let plain = pe.prepare(&collection(false)).unwrap().unwrap();
        pe.flush(&plain).await.unwrap();
        assert!(pe.load("settings", true).await.unwrap().is_some());

        // Written compressed, read as plain.
        let packed = pe.prepare(&collection(true)).unwrap().unwrap();
        pe.flush(&packed).await.unwrap();
        assert!(pe.load("settings", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_blob_loads_as_absent() {
        let backend = InMemoryBackend::new();
        backend.put("lexis_settings", b"%%% not data %%%").await.unwrap();
        let pe = engine(&backend);
        assert!(pe.load("settings", false).await.unwrap().is_none());
        assert!(pe.load("settings", true).await.unwrap().is_none());
        assert!(pe.load("missing", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_surfaces_quota_error() {
        let backend = InMemoryBackend::with_quota(8);
        let pe = engine(&backend);
        let job = pe.prepare(&collection(false)).unwrap().unwrap();
        let err = pe.flush(&job).await.unwrap_err();
        assert!(matches!(err, PersistError::Storage(_)));
        assert!(!backend.contains("lexis_settings"));
    }

    #[test]
    fn test_flush_blocking_writes_without_runtime() {
        let backend = InMemoryBackend::new();
        let pe = engine(&backend);
        let job = pe.prepare(&collection(false)).unwrap().unwrap();
        pe.flush_blocking(&job).unwrap();
        assert!(backend.contains("lexis_settings"));
    }

    /// Backend whose reads fail while `failures` is non-zero.
    struct FailingReads {
        inner: InMemoryBackend,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl StorageBackend for FailingReads {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::BackendUnavailable("locked".to_string()));
            }
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.inner.put(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }
        fn put_blocking(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.inner.put_blocking(key, value)
        }
        async fn flush(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn name(&self) -> &str {
            "failing-reads"
        }
        async fn approximate_size(&self) -> Result<Option<u64>, StorageError> {
            self.inner.approximate_size().await
        }
    }

    #[tokio::test]
    async fn test_read_error_is_not_absence() {
        let inner = InMemoryBackend::new();
        let writer = engine(&inner);
        writer
            .flush(&writer.prepare(&collection(false)).unwrap().unwrap())
            .await
            .unwrap();

        let pe = PersistenceEngine::new(
            Arc::new(FailingReads {
                inner,
                failures: AtomicUsize::new(1),
            }),
            "lexis",
            Arc::new(Base64Compressor),
        );
        assert!(matches!(
            pe.load("settings", false).await,
            Err(PersistError::Storage(_))
        ));
        assert_eq!(pe.load("settings", false).await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_state_round_trip() {
        let backend = InMemoryBackend::new();
        let pe = engine(&backend);
        assert_eq!(pe.load_sync_state().await.unwrap(), (Vec::new(), Vec::new()));

        let pending = vec![SyncOperation::set("vocabulary", "gato", json!("cat"), 1)];
        let mut doomed = SyncOperation::delete("vocabulary", "perro", 2);
        doomed.attempts = 10;
        pe.save_sync_state(&pending, &[doomed.clone()]).await.unwrap();

        assert!(backend.contains("lexis__syncQueue"));
        assert!(backend.contains("lexis__syncDeadLetters"));
        assert_eq!(pe.load_sync_state().await.unwrap(), (pending, vec![doomed]));
    }
}
