// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable key-value capability consumed by the Lexis persistence engine.
//
// Keys are namespaced strings (one per collection), values are opaque encoded
// blobs. Besides the async operations used by periodic flushing, backends must
// offer a blocking write so that teardown code can persist critical data
// without awaiting anything.

use async_trait::async_trait;

use crate::error::StorageError;

/// A pluggable durable key-value backend.
///
/// Implementations must be safe to share across threads and tokio tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieve the blob stored under `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist, rather than an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a blob, overwriting any previous value for `key`.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete the blob stored under `key`.
    ///
    /// Returns `Ok(true)` if the key existed and was removed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Store a blob without suspending.
    ///
    /// Used only on the emergency teardown path, where the host may disappear
    /// before any further asynchronous work gets scheduled.
    fn put_blocking(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Flush any buffered writes to durable storage.
    async fn flush(&self) -> Result<(), StorageError>;

    /// A human-readable name for this backend, used in logging and stats.
    fn name(&self) -> &str;

    /// Return the approximate total size of stored data in bytes, if known.
    async fn approximate_size(&self) -> Result<Option<u64>, StorageError>;
}
