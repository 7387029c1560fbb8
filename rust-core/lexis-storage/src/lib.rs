// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Lexis durable storage capability
//
// The Lexis data engine never talks to a concrete storage medium. It writes
// one encoded blob per collection under a string key (`"<namespace>_<name>"`)
// through the `StorageBackend` trait defined here, so hosts can plug in
// whatever durable key-value namespace they have.
//
// # Modules
//
// - [`backend`] -- The `StorageBackend` trait (async reads/writes plus a
//   blocking write path for teardown-time flushing).
// - [`error`] -- The `StorageError` enum covering backend failure modes,
//   including quota exhaustion.
// - [`memory`] -- An in-memory backend with an optional byte quota, used for
//   tests and ephemeral sessions.
//
// # Example
//
// ```rust
// use lexis_storage::backend::StorageBackend;
// use lexis_storage::memory::InMemoryBackend;
//
// # tokio_test::block_on(async {
// let backend = InMemoryBackend::with_quota(1024);
// backend.put("lexis_settings", b"{}").await.unwrap();
// assert_eq!(backend.get("lexis_settings").await.unwrap(), Some(b"{}".to_vec()));
// # });
// ```

pub mod backend;
pub mod error;
pub mod memory;

// Optional persistent backends, feature-gated.
#[cfg(feature = "redb-backend")]
pub mod redb_backend;

pub use backend::StorageBackend;
pub use error::StorageError;
pub use memory::InMemoryBackend;

#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
