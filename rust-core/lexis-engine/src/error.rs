// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Engine error types.
//!
//! Validation failures ([`EngineError`]) always reach the caller. I/O
//! failures ([`PersistError`], [`SyncReplayError`]) are recovered inside the
//! engine: a failed flush leaves the collection dirty, a failed replay
//! re-queues the operation.

use thiserror::Error;

use lexis_storage::StorageError;

/// Errors surfaced synchronously to callers of the store manager.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("value for {collection}/{key} is {size} bytes, collection budget is {max} bytes")]
    Capacity {
        collection: String,
        key: String,
        size: usize,
        max: usize,
    },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("collection {collection} is already owned by transaction {owner}")]
    ConcurrentTransaction { collection: String, owner: uuid::Uuid },

    #[error("collection {0} is not part of this transaction")]
    NotInTransaction(String),

    #[error("transaction not found: {0}")]
    UnknownTransaction(uuid::Uuid),

    #[error("collection {collection} stores {expected} values, got {found}")]
    TypeMismatch {
        collection: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Raised by a unit of work to abort its transaction.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Failure to write or read a collection's durable copy.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("storage backend error: {0}")]
    Storage(#[from] StorageError),

    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Failure to replay a queued operation against the remote collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncReplayError {
    #[error("remote rejected {key}: {reason}")]
    Rejected { key: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_display() {
        let err = EngineError::Capacity {
            collection: "settings".to_string(),
            key: "theme".to_string(),
            size: 4096,
            max: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("settings/theme"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_aborted_display() {
        let err = EngineError::Aborted("boom".to_string());
        assert_eq!(err.to_string(), "transaction aborted: boom");
    }

    #[test]
    fn test_persist_error_from_storage() {
        let err: PersistError = StorageError::QuotaExceeded { requested: 10, quota: 5 }.into();
        assert!(err.to_string().contains("quota exceeded"));
    }
}
