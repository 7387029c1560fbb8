// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <j.d.a.jewell@open.ac.uk>
//
// redb-backed persistent storage backend for Lexis.
//
// One redb file holds one table of `collection key -> encoded blob`. Every
// write is its own redb write transaction, which is durable on commit, so the
// blocking write used at teardown needs nothing beyond a synchronous commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::debug;

use crate::backend::StorageBackend;
use crate::error::StorageError;

const BLOB_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("collections");

/// A persistent storage backend powered by redb.
///
/// # Example
///
/// ```rust,no_run
/// use lexis_storage::redb_backend::RedbBackend;
/// use lexis_storage::backend::StorageBackend;
///
/// # tokio_test::block_on(async {
/// let store = RedbBackend::open("/tmp/lexis-test.redb").unwrap();
/// store.put("lexis_settings", b"{}").await.unwrap();
/// # });
/// ```
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    ///
    /// Creates parent directories if they don't exist. The blob table is
    /// created on first write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
        }

        let db = Database::create(&path).map_err(|e| {
            StorageError::BackendUnavailable(format!(
                "failed to open redb at {}: {}",
                path.display(),
                e
            ))
        })?;

        debug!(path = %path.display(), "opened redb backend");

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Return the filesystem path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish()
    }
}

fn read_blob(db: &Database, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let txn = db
        .begin_read()
        .map_err(|e| StorageError::BackendUnavailable(format!("read txn: {e}")))?;

    let table = match txn.open_table(BLOB_TABLE) {
        Ok(t) => t,
        // Nothing has been written yet.
        Err(_) => return Ok(None),
    };

    match table.get(key) {
        Ok(Some(value)) => Ok(Some(value.value().to_vec())),
        Ok(None) => Ok(None),
        Err(e) => Err(StorageError::CorruptedData(format!("get: {e}"))),
    }
}

fn write_blob(db: &Database, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let txn = db
        .begin_write()
        .map_err(|e| StorageError::BackendUnavailable(format!("write txn: {e}")))?;
    {
        let mut table = txn
            .open_table(BLOB_TABLE)
            .map_err(|e| StorageError::BackendUnavailable(format!("open table: {e}")))?;
        table
            .insert(key, value)
            .map_err(|e| StorageError::CorruptedData(format!("insert: {e}")))?;
    }
    txn.commit()
        .map_err(|e| StorageError::CorruptedData(format!("commit: {e}")))
}

fn remove_blob(db: &Database, key: &str) -> Result<bool, StorageError> {
    let txn = db
        .begin_write()
        .map_err(|e| StorageError::BackendUnavailable(format!("write txn: {e}")))?;
    let existed = {
        let mut table = txn
            .open_table(BLOB_TABLE)
            .map_err(|e| StorageError::BackendUnavailable(format!("open table: {e}")))?;
        let removed = table
            .remove(key)
            .map_err(|e| StorageError::CorruptedData(format!("remove: {e}")))?;
        removed.is_some()
    };
    txn.commit()
        .map_err(|e| StorageError::CorruptedData(format!("commit: {e}")))?;
    Ok(existed)
}

fn join_error(e: tokio::task::JoinError) -> StorageError {
    StorageError::BackendUnavailable(format!("task join: {e}"))
}

#[async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || read_blob(&db, &key))
            .await
            .map_err(join_error)?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || write_blob(&db, &key, &value))
            .await
            .map_err(join_error)?
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || remove_blob(&db, &key))
            .await
            .map_err(join_error)?
    }

    fn put_blocking(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        write_blob(&self.db, key, value)
    }

    async fn flush(&self) -> Result<(), StorageError> {
        // Each write transaction is fsynced on commit.
        Ok(())
    }

    fn name(&self) -> &str {
        "redb"
    }

    async fn approximate_size(&self) -> Result<Option<u64>, StorageError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(_) => Ok(None),
        }
    }
}
