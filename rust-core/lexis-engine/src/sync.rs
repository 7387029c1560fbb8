// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Deferred sync queue.
//!
//! Mutations to sync-enabled collections are recorded as [`SyncOperation`]s
//! and replayed in FIFO order against a [`RemoteSync`] collaborator whenever
//! it reports itself online. Delivery is at-least-once: the remote must treat
//! set and delete as idempotent upserts/removals.
//!
//! A drain moves the whole queue to an in-flight list and replays it in
//! order. An operation leaves that list only once the remote has answered:
//! it is dropped on success, or appended to the tail of the (now current)
//! queue on failure. Failures keep their relative order; operations enqueued
//! during the drain may land ahead of them. In-flight operations still count
//! as pending, so they are persisted with the queue, and a drain dropped
//! midway puts the unanswered ones back at the head. An operation that keeps
//! failing is moved to the dead-letter list once it reaches
//! [`SyncPolicy::max_attempts`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::SyncReplayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Set,
    Delete,
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub collection: String,
    pub kind: SyncKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Epoch milliseconds when the mutation was recorded.
    pub queued_at: i64,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl SyncOperation {
    pub fn set(collection: &str, key: &str, value: Value, queued_at: i64) -> Self {
        Self {
            collection: collection.to_string(),
            kind: SyncKind::Set,
            key: key.to_string(),
            value: Some(value),
            queued_at,
            attempts: 0,
        }
    }

    pub fn delete(collection: &str, key: &str, queued_at: i64) -> Self {
        Self {
            collection: collection.to_string(),
            kind: SyncKind::Delete,
            key: key.to_string(),
            value: None,
            queued_at,
            attempts: 0,
        }
    }
}

/// The remote endpoint operations are replayed against.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn replay(&self, op: &SyncOperation) -> Result<(), SyncReplayError>;

    /// Connectivity as seen by the host.
    fn is_online(&self) -> bool {
        true
    }
}

/// Retry policy for failed replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Failed attempts after which an operation is dead-lettered.
    /// `None` re-queues forever.
    pub max_attempts: Option<u32>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
        }
    }
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// False when the drain was skipped (offline, empty, or already running).
    pub ran: bool,
    pub replayed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SyncOperation>,
    /// Taken by the running drain and not yet answered, oldest first.
    in_flight: VecDeque<SyncOperation>,
    dead_letters: Vec<SyncOperation>,
}

/// Ends a drain however its future finishes: unanswered operations go back
/// to the head of the queue and the draining flag is cleared.
struct DrainGuard<'a>(&'a SyncQueue);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if !state.in_flight.is_empty() {
            warn!(returned = state.in_flight.len(), "Sync drain interrupted, operations returned to queue");
            while let Some(op) = state.in_flight.pop_back() {
                state.pending.push_front(op);
            }
        }
        drop(state);
        self.0.draining.store(false, Ordering::Release);
    }
}

/// FIFO queue of pending sync operations.
#[derive(Debug, Default)]
pub struct SyncQueue {
    state: Mutex<QueueState>,
    draining: AtomicBool,
    policy: SyncPolicy,
}

impl SyncQueue {
    pub fn new(policy: SyncPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn enqueue(&self, op: SyncOperation) {
        debug!(collection = %op.collection, key = %op.key, kind = ?op.kind, "Sync operation queued");
        self.state.lock().pending.push_back(op);
    }

    /// Put operations saved by an earlier process ahead of anything queued
    /// since startup, and their dead letters ahead of any new ones.
    pub fn restore(&self, pending: Vec<SyncOperation>, dead_letters: Vec<SyncOperation>) {
        let mut state = self.state.lock();
        for op in pending.into_iter().rev() {
            state.pending.push_front(op);
        }
        if !dead_letters.is_empty() {
            state.dead_letters.splice(0..0, dead_letters);
        }
        debug!(
            pending = state.pending.len(),
            dead_letters = state.dead_letters.len(),
            "Sync queue restored"
        );
    }

    /// Operations not yet acknowledged by the remote, including any a
    /// running drain is replaying.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.in_flight.len() + state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the unacknowledged operations, oldest first.
    pub fn pending(&self) -> Vec<SyncOperation> {
        let state = self.state.lock();
        state.in_flight.iter().chain(state.pending.iter()).cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.state.lock().dead_letters.clone()
    }

    /// Replay everything currently queued against `remote`.
    ///
    /// Each operation stays visible to [`pending`](Self::pending) until the
    /// remote has answered for it.
    #[instrument(skip_all)]
    pub async fn drain(&self, remote: &dyn RemoteSync) -> DrainReport {
        if !remote.is_online() {
            debug!(pending = self.len(), "Remote offline, sync drain skipped");
            return DrainReport::default();
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Sync drain already running");
            return DrainReport::default();
        }
        let _guard = DrainGuard(self);

        let batch = {
            let mut state = self.state.lock();
            let taken: Vec<SyncOperation> = state.pending.drain(..).collect();
            state.in_flight.extend(taken);
            state.in_flight.len()
        };
        if batch == 0 {
            return DrainReport::default();
        }

        let mut report = DrainReport {
            ran: true,
            ..Default::default()
        };

        loop {
            let next = self.state.lock().in_flight.front().cloned();
            let Some(op) = next else {
                break;
            };
            let result = remote.replay(&op).await;

            let mut state = self.state.lock();
            let Some(mut op) = state.in_flight.pop_front() else {
                break;
            };
            match result {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    op.attempts += 1;
                    if self.policy.max_attempts.is_some_and(|max| op.attempts >= max) {
                        warn!(
                            collection = %op.collection,
                            key = %op.key,
                            attempts = op.attempts,
                            error = %e,
                            "Sync operation dead-lettered"
                        );
                        state.dead_letters.push(op);
                        report.dead_lettered += 1;
                    } else {
                        warn!(
                            collection = %op.collection,
                            key = %op.key,
                            attempts = op.attempts,
                            error = %e,
                            "Sync replay failed, re-queued"
                        );
                        state.pending.push_back(op);
                        report.requeued += 1;
                    }
                }
            }
        }

        info!(
            replayed = report.replayed,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            "Sync drain finished"
        );
        report
    }
}

/// Replays operations as JSON requests: `PUT <endpoint>/<collection>/<key>`
/// for sets, `DELETE` for deletes.
#[cfg(feature = "http-sync")]
pub struct HttpRemote {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    online: AtomicBool,
}

#[cfg(feature = "http-sync")]
impl HttpRemote {
    pub fn new(endpoint: &str) -> Result<Self, SyncReplayError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| SyncReplayError::Transport(format!("invalid endpoint: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(SyncReplayError::Transport(format!(
                "endpoint cannot be a base URL: {endpoint}"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            online: AtomicBool::new(true),
        })
    }

    /// Record host connectivity changes.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    fn url_for(&self, op: &SyncOperation) -> reqwest::Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&op.collection).push(&op.key);
        }
        url
    }
}

#[cfg(feature = "http-sync")]
#[async_trait]
impl RemoteSync for HttpRemote {
    async fn replay(&self, op: &SyncOperation) -> Result<(), SyncReplayError> {
        let url = self.url_for(op);
        let request = match op.kind {
            SyncKind::Set => self.client.put(url).json(op),
            SyncKind::Delete => self.client.delete(url),
        };
        let response = request
            .send()
            .await
            .map_err(|e| SyncReplayError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SyncReplayError::Rejected {
                key: op.key.clone(),
                reason: response.status().to_string(),
            })
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    /// Records replayed keys; fails keys listed in `failing`.
    #[derive(Default)]
    struct ScriptedRemote {
        online: AtomicBool,
        failing: Mutex<HashSet<String>>,
        replayed: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn online() -> Self {
            let remote = Self::default();
            remote.online.store(true, Ordering::SeqCst);
            remote
        }
    }

    #[async_trait]
    impl RemoteSync for ScriptedRemote {
        async fn replay(&self, op: &SyncOperation) -> Result<(), SyncReplayError> {
            if self.failing.lock().contains(&op.key) {
                return Err(SyncReplayError::Transport("503".to_string()));
            }
            self.replayed.lock().push(op.key.clone());
            Ok(())
        }

        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    fn queue_with(keys: &[&str]) -> SyncQueue {
        let queue = SyncQueue::new(SyncPolicy::default());
        for (i, key) in keys.iter().enumerate() {
            queue.enqueue(SyncOperation::set("vocabulary", key, json!(i), i as i64));
        }
        queue
    }

    #[tokio::test]
    async fn test_offline_drain_is_noop() {
        let queue = queue_with(&["a", "b"]);
        let remote = ScriptedRemote::default();
        let report = queue.drain(&remote).await;
        assert!(!report.ran);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_replay() {
        let queue = queue_with(&["a", "b", "c"]);
        let remote = ScriptedRemote::online();
        let report = queue.drain(&remote).await;
        assert_eq!(report.replayed, 3);
        assert_eq!(*remote.replayed.lock(), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failures_requeued_in_order() {
        let queue = queue_with(&["a", "b", "c", "d"]);
        let remote = ScriptedRemote::online();
        remote.failing.lock().extend(["b".to_string(), "d".to_string()]);

        let report = queue.drain(&remote).await;
        assert_eq!(report.replayed, 2);
        assert_eq!(report.requeued, 2);
        assert_eq!(*remote.replayed.lock(), vec!["a", "c"]);

        let pending = queue.pending();
        assert_eq!(
            pending.iter().map(|op| op.key.as_str()).collect::<Vec<_>>(),
            vec!["b", "d"]
        );
        assert!(pending.iter().all(|op| op.attempts == 1));

        remote.failing.lock().clear();
        queue.drain(&remote).await;
        assert_eq!(*remote.replayed.lock(), vec!["a", "c", "b", "d"]);
    }

    #[tokio::test]
    async fn test_same_key_not_coalesced() {
        let queue = SyncQueue::new(SyncPolicy::default());
        queue.enqueue(SyncOperation::set("settings", "volume", json!(0.1), 1));
        queue.enqueue(SyncOperation::set("settings", "volume", json!(0.9), 2));
        assert_eq!(queue.len(), 2);
        let remote = ScriptedRemote::online();
        assert_eq!(queue.drain(&remote).await.replayed, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let queue = SyncQueue::new(SyncPolicy {
            max_attempts: Some(2),
        });
        queue.enqueue(SyncOperation::delete("vocabulary", "doomed", 0));
        let remote = ScriptedRemote::online();
        remote.failing.lock().insert("doomed".to_string());

        assert_eq!(queue.drain(&remote).await.requeued, 1);
        assert_eq!(queue.drain(&remote).await.dead_lettered, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.dead_letters()[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_unbounded_policy_keeps_requeueing() {
        let queue = SyncQueue::new(SyncPolicy { max_attempts: None });
        queue.enqueue(SyncOperation::delete("vocabulary", "k", 0));
        let remote = ScriptedRemote::online();
        remote.failing.lock().insert("k".to_string());
        for _ in 0..20 {
            queue.drain(&remote).await;
        }
        assert_eq!(queue.pending()[0].attempts, 20);
        assert!(queue.dead_letters().is_empty());
    }

    #[test]
    fn test_restore_goes_ahead_of_new_work() {
        let queue = queue_with(&["new"]);
        queue.restore(
            vec![
                SyncOperation::delete("vocabulary", "old1", 0),
                SyncOperation::delete("vocabulary", "old2", 0),
            ],
            vec![SyncOperation::delete("vocabulary", "dead", 0)],
        );
        let keys: Vec<String> = queue.pending().into_iter().map(|op| op.key).collect();
        assert_eq!(keys, vec!["old1", "old2", "new"]);
        assert_eq!(queue.dead_letters()[0].key, "dead");
    }

    /// Answers every key except `stall_on`, whose replay never completes.
    struct StallingRemote {
        stall_on: &'static str,
        replayed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteSync for StallingRemote {
        async fn replay(&self, op: &SyncOperation) -> Result<(), SyncReplayError> {
            if op.key == self.stall_on {
                std::future::pending::<()>().await;
            }
            self.replayed.lock().push(op.key.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unanswered_operations_stay_pending() {
        let queue = queue_with(&["a", "b", "c"]);
        let stalling = StallingRemote {
            stall_on: "b",
            replayed: Mutex::new(Vec::new()),
        };

        {
            let drain = queue.drain(&stalling);
            tokio::pin!(drain);
            let finished = tokio::time::timeout(std::time::Duration::from_millis(20), &mut drain).await;
            assert!(finished.is_err());

            // "a" was answered; "b" is in flight and "c" not yet sent.
            let keys: Vec<String> = queue.pending().into_iter().map(|op| op.key).collect();
            assert_eq!(keys, vec!["b", "c"]);
            assert_eq!(queue.len(), 2);
        }

        // Dropping the drain hands the unanswered operations back, in order.
        queue.enqueue(SyncOperation::set("vocabulary", "d", json!(3), 3));
        let keys: Vec<String> = queue.pending().into_iter().map(|op| op.key).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);

        let remote = ScriptedRemote::online();
        let report = queue.drain(&remote).await;
        assert!(report.ran);
        assert_eq!(*remote.replayed.lock(), vec!["b", "c", "d"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_operation_wire_format() {
        let op = SyncOperation::delete("achievements", "first-login", 42);
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({"collection": "achievements", "kind": "delete", "key": "first-login", "queuedAt": 42, "attempts": 0})
        );
    }
}
