// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property-based tests for the Lexis engine

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};

use lexis_engine::{
    CacheLayer, EngineConfig, EngineError, Entry, RemoteSync, SetOptions, StoreManager, SyncOperation,
    SyncPolicy, SyncQueue, SyncReplayError,
};
use lexis_storage::InMemoryBackend;

/// Generate arbitrary entry keys
fn arb_key() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

/// Generate arbitrary small JSON values
fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        "[A-Za-z ]{0,40}".prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        ("[a-z]{1,6}", 0u8..5).prop_map(|(native, mastery)| json!({ "native": native, "mastery": mastery })),
    ]
}

/// A write or delete against one of the given collections
#[derive(Debug, Clone)]
enum Op {
    Set(&'static str, String, Value),
    Delete(&'static str, String),
}

fn arb_op(collections: &'static [&'static str]) -> impl Strategy<Value = Op> {
    let pick = 0..collections.len();
    prop_oneof![
        3 => (pick.clone(), arb_key(), arb_value()).prop_map(move |(i, k, v)| Op::Set(collections[i], k, v)),
        1 => (pick, arb_key()).prop_map(move |(i, k)| Op::Delete(collections[i], k)),
    ]
}

const TXN_SCOPE: &[&str] = &["userProgress", "achievements", "vocabulary"];
const EXPORTED: &[&str] = &["vocabulary", "settings", "userProgress"];

fn create_test_store() -> StoreManager<InMemoryBackend> {
    StoreManager::new(EngineConfig::default(), InMemoryBackend::new()).unwrap()
}

/// Remote that rejects a fixed set of keys and records what it accepted.
struct SelectiveRemote {
    rejected: BTreeSet<String>,
    accepted: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteSync for SelectiveRemote {
    async fn replay(&self, op: &SyncOperation) -> Result<(), SyncReplayError> {
        if self.rejected.contains(&op.key) {
            return Err(SyncReplayError::Rejected {
                key: op.key.clone(),
                reason: "rejected".to_string(),
            });
        }
        self.accepted.lock().push(op.key.clone());
        Ok(())
    }
}

proptest! {
    #[test]
    fn test_cache_never_exceeds_ceiling(
        ceiling in 64usize..2048,
        puts in prop::collection::vec((arb_key(), arb_value()), 1..200)
    ) {
        let mut cache = CacheLayer::new(ceiling);

        for (key, value) in &puts {
            let entry = Entry::new(value.clone(), 0, 0);
            let cached = cache.put("vocabulary", key, &entry);

            prop_assert!(cache.total_size() <= ceiling);
            // A slot that fits is always present right after its put.
            prop_assert_eq!(cached, cache.contains("vocabulary", key));
        }
    }

    #[test]
    fn test_failed_transaction_restores_prior_state(
        setup in prop::collection::vec(arb_op(TXN_SCOPE), 0..20),
        attempted in prop::collection::vec(arb_op(TXN_SCOPE), 1..20)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = create_test_store();
            for op in &setup {
                match op {
                    Op::Set(c, k, v) => store.set(c, k, v, SetOptions::default()).await.unwrap(),
                    Op::Delete(c, k) => {
                        store.delete(c, k).await.unwrap();
                    }
                }
            }

            let before = store.export_snapshot().await.collections;
            let pending_before = store.pending_sync().len();

            let result = store
                .transaction(TXN_SCOPE, |txn| async move {
                    for op in attempted {
                        match op {
                            Op::Set(c, k, v) => txn.set(c, &k, &v)?,
                            Op::Delete(c, k) => {
                                txn.delete(c, &k)?;
                            }
                        }
                    }
                    Err::<(), _>(EngineError::Aborted("property".to_string()))
                })
                .await;
            prop_assert!(result.is_err());

            let after = store.export_snapshot().await.collections;
            prop_assert_eq!(before, after);
            prop_assert_eq!(store.pending_sync().len(), pending_before);
            prop_assert_eq!(store.stats().transactions.active, 0);

            Ok(())
        })?;
    }

    #[test]
    fn test_sync_drain_preserves_fifo_order(
        keys in prop::collection::vec(arb_key(), 1..40),
        rejected in prop::collection::btree_set(arb_key(), 0..5)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let queue = SyncQueue::new(SyncPolicy { max_attempts: None });
            for (i, key) in keys.iter().enumerate() {
                queue.enqueue(SyncOperation::set("vocabulary", key, json!(i), i as i64));
            }

            let remote = SelectiveRemote {
                rejected: rejected.clone(),
                accepted: Mutex::new(Vec::new()),
            };
            let report = queue.drain(&remote).await;

            let expected_accepted: Vec<String> =
                keys.iter().filter(|k| !rejected.contains(*k)).cloned().collect();
            let expected_pending: Vec<String> =
                keys.iter().filter(|k| rejected.contains(*k)).cloned().collect();

            prop_assert_eq!(report.replayed, expected_accepted.len());
            prop_assert_eq!(report.requeued, expected_pending.len());
            prop_assert_eq!(remote.accepted.lock().clone(), expected_accepted);

            let pending = queue.pending();
            let pending_keys: Vec<String> = pending.iter().map(|op| op.key.clone()).collect();
            prop_assert_eq!(pending_keys, expected_pending);
            prop_assert!(pending.iter().all(|op| op.attempts == 1));

            Ok(())
        })?;
    }

    #[test]
    fn test_export_import_reproduces_entries(
        ops in prop::collection::vec(arb_op(EXPORTED), 1..30)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let source = create_test_store();
            for op in &ops {
                match op {
                    Op::Set(c, k, v) => source.set(c, k, v, SetOptions::default()).await.unwrap(),
                    Op::Delete(c, k) => {
                        source.delete(c, k).await.unwrap();
                    }
                }
            }

            let json = serde_json::to_string(&source.export_snapshot().await).unwrap();
            let target = create_test_store();
            target.import_snapshot(serde_json::from_str(&json).unwrap()).await.unwrap();

            for name in EXPORTED {
                let expected: BTreeMap<String, Value> = source.get_all(name).await.unwrap();
                prop_assert_eq!(target.get_all(name).await.unwrap(), expected);
            }
            prop_assert!(target.pending_sync().is_empty());

            Ok(())
        })?;
    }
}
