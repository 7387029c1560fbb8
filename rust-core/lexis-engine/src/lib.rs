// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Lexis data engine
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Embedded multi-collection store behind the vocabulary trainer: named
// collections with their own TTL and size policies, one bounded cache shared
// by all of them, snapshot/rollback transactions, dirty-tracking persistence
// over a pluggable `StorageBackend`, and a FIFO sync queue that survives
// offline periods.
//
// # Architecture
//
// ```text
//                 ┌──────────────────── StoreManager ────────────────────┐
//  set/get/... ─> │ CacheLayer ─> Collection ─> PersistenceEngine (load) │
//                 │      TransactionManager        SyncQueue ──> Remote  │
//                 └──────────────────────┬───────────────────────────────┘
//                                        │ flush / emergency flush
//                                        ▼
//                                 StorageBackend
// ```
//
// ## Persisted layout
//
// One blob per persistent collection under `"<namespace>_<collection>"`
// holding `{ key: { value, writtenAt, ttl, metadata } }` as JSON, wrapped by
// the configured `Compressor` when the collection's `compress` flag is set.
// Pending sync operations live under `"<namespace>__syncQueue"` and dead
// letters under `"<namespace>__syncDeadLetters"`; collection names starting
// with `_` are rejected so the two never collide.
//
// ## Usage
//
// ```rust
// use lexis_engine::{EngineConfig, SetOptions, StoreManager};
// use lexis_storage::InMemoryBackend;
//
// # tokio_test::block_on(async {
// let store = StoreManager::new(EngineConfig::default(), InMemoryBackend::new()).unwrap();
//
// store.set("settings", "volume", &0.8, SetOptions::default()).await.unwrap();
// assert_eq!(store.get::<f64>("settings", "volume").await.unwrap(), Some(0.8));
//
// store.tick().await;
// # });
// ```

pub mod cache;
pub mod clock;
pub mod collection;
pub mod compression;
pub mod config;
pub mod entry;
pub mod error;
pub mod persistence;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod typed;

pub use cache::{CacheLayer, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::{Collection, CollectionConfig, CollectionStats, ValueKind};
pub use compression::{Base64Compressor, Compressor, IdentityCompressor};
pub use config::{default_collections, CollectionSpec, EngineConfig};
pub use entry::Entry;
pub use error::{EngineError, PersistError, SyncReplayError};
pub use persistence::PersistenceEngine;
pub use store::{
    EngineStats, FlushReport, ImportReport, SchedulerHandle, SetOptions, Snapshot, StoreBuilder,
    StoreManager, TeardownGuard, TickReport, TxnHandle,
};
pub use sync::{DrainReport, RemoteSync, SyncKind, SyncOperation, SyncPolicy, SyncQueue};
pub use transaction::{TransactionManager, TransactionState, TransactionStats};
pub use typed::TypedCollection;

#[cfg(feature = "http-sync")]
pub use sync::HttpRemote;
