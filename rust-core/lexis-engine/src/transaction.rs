// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Snapshot/rollback transactions over a named set of collections.
//!
//! # Transaction State Machine
//!
//! ```text
//! ┌────────┐  begin()   ┌────────┐  commit()   ┌───────────┐
//! │  None  │ ──────────>│ Active │ ──────────> │ Committed │
//! └────────┘            └────────┘             └───────────┘
//!                            │
//!                            │ rollback()
//!                            ▼
//!                       ┌────────────┐
//!                       │ RolledBack │
//!                       └────────────┘
//! ```
//!
//! Each collection has at most one owning transaction. `begin` copies the
//! entry map of every participating collection; `rollback` hands those
//! copies back so the caller can restore them. Overlapping scopes fail fast
//! with [`EngineError::ConcurrentTransaction`] instead of nesting.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entry::Entry;
use crate::error::EngineError;

/// Saved entry maps, keyed by collection name.
pub type SavedEntries = BTreeMap<String, BTreeMap<String, Entry>>;

/// The lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// An in-flight unit of work.
#[derive(Debug)]
pub struct Transaction {
    pub id: Uuid,
    pub state: TransactionState,
    pub collections: BTreeSet<String>,
    snapshot: SavedEntries,
    pub started_at: DateTime<Utc>,
}

/// Transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStats {
    pub active: usize,
    pub committed: u64,
    pub rolled_back: u64,
}

/// Tracks active transactions and which collections they own.
#[derive(Debug, Default)]
pub struct TransactionManager {
    active: HashMap<Uuid, Transaction>,
    owners: HashMap<String, Uuid>,
    committed: u64,
    rolled_back: u64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if any of `names` is owned by an active transaction.
    pub fn ensure_available<'a, I>(&self, names: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for name in names {
            if let Some(owner) = self.owners.get(name) {
                return Err(EngineError::ConcurrentTransaction {
                    collection: name.clone(),
                    owner: *owner,
                });
            }
        }
        Ok(())
    }

    /// Open a transaction over the collections in `snapshot`.
    pub fn begin(&mut self, snapshot: SavedEntries) -> Result<Uuid, EngineError> {
        self.ensure_available(snapshot.keys())?;

        let txn = Transaction {
            id: Uuid::new_v4(),
            state: TransactionState::Active,
            collections: snapshot.keys().cloned().collect(),
            snapshot,
            started_at: Utc::now(),
        };
        let id = txn.id;
        for name in &txn.collections {
            self.owners.insert(name.clone(), id);
        }

        info!(
            transaction = %id,
            collections = ?txn.collections,
            "Transaction started"
        );
        self.active.insert(id, txn);
        Ok(id)
    }

    fn finish(&mut self, id: Uuid, state: TransactionState) -> Result<Transaction, EngineError> {
        let mut txn = self
            .active
            .remove(&id)
            .ok_or(EngineError::UnknownTransaction(id))?;
        for name in &txn.collections {
            self.owners.remove(name);
        }
        txn.state = state;
        debug!(transaction = %id, state = ?state, "Locks released");
        Ok(txn)
    }

    /// Commit: discard the snapshot and release the collections.
    ///
    /// Returns the participating collection names.
    pub fn commit(&mut self, id: Uuid) -> Result<BTreeSet<String>, EngineError> {
        let txn = self.finish(id, TransactionState::Committed)?;
        self.committed += 1;
        info!(
            transaction = %id,
            elapsed_ms = (Utc::now() - txn.started_at).num_milliseconds(),
            "Transaction committed"
        );
        Ok(txn.collections)
    }

    /// Roll back: release the collections and return their saved entries.
    pub fn rollback(&mut self, id: Uuid) -> Result<SavedEntries, EngineError> {
        let txn = self.finish(id, TransactionState::RolledBack)?;
        self.rolled_back += 1;
        info!(
            transaction = %id,
            collections = txn.collections.len(),
            "Transaction rolled back"
        );
        Ok(txn.snapshot)
    }

    pub fn owner_of(&self, collection: &str) -> Option<Uuid> {
        self.owners.get(collection).copied()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            active: self.active.len(),
            committed: self.committed,
            rolled_back: self.rolled_back,
        }
    }
}
