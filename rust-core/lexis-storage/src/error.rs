// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Storage error types for the Lexis durable storage capability.

use thiserror::Error;

/// Errors that can occur when interacting with a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred in the underlying storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The host refused the write because its storage quota is exhausted.
    #[error("storage quota exceeded: {requested} bytes requested (quota: {quota})")]
    QuotaExceeded {
        /// Total bytes the store would hold after the write.
        requested: u64,
        /// Configured quota in bytes.
        quota: u64,
    },

    /// The stored data is corrupted or in an unexpected format.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// The storage backend is not available (e.g., file locked, handle lost).
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl StorageError {
    /// True when retrying later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::BackendUnavailable(_))
    }
}
