// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Named collections.
//!
//! A [`Collection`] owns the authoritative entries for one namespace and
//! tracks whether they differ from the durable copy (`dirty`). Every
//! successful mutation bumps a generation counter; a flush may only clear the
//! dirty flag if the generation it encoded is still current.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entry::{value_size, Entry};
use crate::error::EngineError;

/// The kind of value a collection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Any,
    Bool,
    Number,
    Text,
    List,
    Record,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::List => "list",
            ValueKind::Record => "record",
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Number => value.is_number(),
            ValueKind::Text => value.is_string(),
            ValueKind::List => value.is_array(),
            ValueKind::Record => value.is_object(),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}

/// Per-collection policy, fixed at engine construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Written to the storage backend by flushes.
    pub persistent: bool,
    /// Reads and writes go through the shared cache layer.
    pub cached: bool,
    /// Byte ceiling for a single value's serialized size.
    pub max_bytes: usize,
    /// Default TTL for new entries in milliseconds; 0 disables expiry.
    pub ttl_ms: u64,
    /// Mutations are queued for replay against the remote collaborator.
    pub sync: bool,
    /// The encoded collection is wrapped by the configured compressor.
    pub compress: bool,
    /// Writes are flushed immediately and survive emergency teardown.
    pub critical: bool,
    pub kind: ValueKind,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            cached: true,
            max_bytes: 1024 * 1024,
            ttl_ms: 0,
            sync: false,
            compress: false,
            critical: false,
            kind: ValueKind::Any,
        }
    }
}

/// Point-in-time statistics for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub entries: usize,
    pub bytes: usize,
    pub dirty: bool,
    pub persistent: bool,
    pub last_access: i64,
}

/// A named mapping from key to [`Entry`].
#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    entries: BTreeMap<String, Entry>,
    config: CollectionConfig,
    dirty: bool,
    generation: u64,
    last_access: i64,
    hydrated: bool,
}

impl Collection {
    /// Set up a collection. Memory-only collections have nothing to hydrate.
    pub fn configure(name: impl Into<String>, config: CollectionConfig) -> Self {
        let hydrated = !config.persistent;
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            config,
            dirty: false,
            generation: 0,
            last_access: 0,
            hydrated,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, Entry> {
        &self.entries
    }

    pub fn touch(&mut self, now: i64) {
        self.last_access = now;
    }

    /// Check an incoming value against the kind and byte budget.
    ///
    /// Returns the value's estimated size.
    pub fn validate(&self, key: &str, value: &Value) -> Result<usize, EngineError> {
        if !self.config.kind.accepts(value) {
            return Err(EngineError::TypeMismatch {
                collection: self.name.clone(),
                expected: self.config.kind.name(),
                found: describe(value),
            });
        }
        let size = value_size(value);
        if size > self.config.max_bytes {
            return Err(EngineError::Capacity {
                collection: self.name.clone(),
                key: key.to_string(),
                size,
                max: self.config.max_bytes,
            });
        }
        Ok(size)
    }

    /// Look up a live entry. An expired entry is removed and reported absent.
    pub fn read(&mut self, key: &str, now: i64) -> Option<&Entry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
            debug!(collection = %self.name, key = key, "Expired entry removed on read");
            return None;
        }
        self.entries.get(key)
    }

    /// Insert or replace an entry. Nothing changes if validation fails.
    pub fn write(&mut self, key: &str, entry: Entry) -> Result<(), EngineError> {
        self.validate(key, &entry.value)?;
        self.entries.insert(key.to_string(), entry);
        self.mark_dirty();
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Remove every entry. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        if count > 0 {
            self.entries.clear();
            self.mark_dirty();
        }
        count
    }

    /// Values of all live entries accepted by `predicate`.
    pub fn scan<F>(&self, now: i64, mut predicate: F) -> BTreeMap<String, Value>
    where
        F: FnMut(&str, &Value) -> bool,
    {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(key, entry)| predicate(key, &entry.value))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Drop expired entries, returning their keys.
    pub fn purge_expired(&mut self, now: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Copy of the entry map, for transactional rollback.
    pub fn snapshot(&self) -> BTreeMap<String, Entry> {
        self.entries.clone()
    }

    /// Replace the entry map with a snapshot taken earlier.
    pub fn restore(&mut self, snapshot: BTreeMap<String, Entry>) {
        self.entries = snapshot;
    }

    /// Fold in the durable copy. Keys already in memory win; expired
    /// persisted entries are skipped. Returns how many entries were added.
    pub fn merge_persisted(&mut self, persisted: BTreeMap<String, Entry>, now: i64) -> usize {
        let mut added = 0;
        for (key, entry) in persisted {
            if entry.is_expired(now) || self.entries.contains_key(&key) {
                continue;
            }
            self.entries.insert(key, entry);
            added += 1;
        }
        self.hydrated = true;
        added
    }

    /// Bulk-load entries (snapshot import), overwriting existing keys.
    pub fn import(&mut self, entries: BTreeMap<String, Entry>) -> usize {
        let count = entries.len();
        self.entries.extend(entries);
        self.hydrated = true;
        self.mark_dirty();
        count
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    /// Clear the dirty flag if nothing changed since `generation` was read.
    pub fn mark_clean(&mut self, generation: u64) -> bool {
        if self.generation == generation {
            self.dirty = false;
        }
        !self.dirty
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            name: self.name.clone(),
            entries: self.entries.len(),
            bytes: self.entries.values().map(Entry::estimated_size).sum(),
            dirty: self.dirty,
            persistent: self.config.persistent,
            last_access: self.last_access,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> Collection {
        Collection::configure("settings", CollectionConfig::default())
    }

    #[test]
    fn test_write_marks_dirty_and_bumps_generation() {
        let mut coll = settings();
        assert!(!coll.is_dirty());
        coll.write("volume", Entry::new(json!(0.8), 0, 0)).unwrap();
        assert!(coll.is_dirty());
        assert_eq!(coll.generation(), 1);
        assert_eq!(coll.read("volume", 0).unwrap().value, json!(0.8));
    }

    #[test]
    fn test_capacity_rejection_changes_nothing() {
        let config = CollectionConfig {
            max_bytes: 8,
            ..Default::default()
        };
        let mut coll = Collection::configure("tiny", config);
        let err = coll
            .write("k", Entry::new(json!("far too long for this"), 0, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Capacity { size: 23, max: 8, .. }));
        assert!(coll.is_empty());
        assert!(!coll.is_dirty());
        assert_eq!(coll.generation(), 0);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let config = CollectionConfig {
            kind: ValueKind::Number,
            ..Default::default()
        };
        let mut coll = Collection::configure("scores", config);
        coll.write("a", Entry::new(json!(3), 0, 0)).unwrap();
        let err = coll.write("b", Entry::new(json!("three"), 0, 0)).unwrap_err();
        match err {
            EngineError::TypeMismatch { expected, found, .. } => {
                assert_eq!(expected, "number");
                assert_eq!(found, "text");
            }
            other => panic!("expected TypeMismatch, got: {:?}", other),
        }
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let mut coll = settings();
        coll.write("otp", Entry::new(json!("1234"), 1_000, 100)).unwrap();
        assert!(coll.read("otp", 1_100).is_some());
        assert!(coll.read("otp", 1_101).is_none());
        assert!(coll.is_empty());
    }

    #[test]
    fn test_remove_absent_key_leaves_clean() {
        let mut coll = settings();
        assert!(!coll.remove("missing"));
        assert!(!coll.is_dirty());
    }

    #[test]
    fn test_scan_skips_expired_and_filters() {
        let mut coll = settings();
        coll.write("a", Entry::new(json!(1), 0, 0)).unwrap();
        coll.write("b", Entry::new(json!(2), 0, 10)).unwrap();
        coll.write("c", Entry::new(json!(3), 0, 0)).unwrap();

        let all = coll.scan(100, |_, _| true);
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["a", "c"]);

        let odd = coll.scan(0, |_, v| v.as_i64().is_some_and(|n| n % 2 == 1));
        assert_eq!(odd.len(), 2);
        assert!(odd.contains_key("a") && odd.contains_key("c"));
    }

    #[test]
    fn test_purge_expired_returns_keys() {
        let mut coll = settings();
        coll.write("keep", Entry::new(json!(1), 0, 0)).unwrap();
        coll.write("drop", Entry::new(json!(2), 0, 5)).unwrap();
        assert_eq!(coll.purge_expired(6), vec!["drop".to_string()]);
        assert_eq!(coll.len(), 1);
    }

    #[test]
    fn test_mark_clean_only_for_current_generation() {
        let mut coll = settings();
        coll.write("a", Entry::new(json!(1), 0, 0)).unwrap();
        let encoded_at = coll.generation();
        coll.write("b", Entry::new(json!(2), 0, 0)).unwrap();

        // A flush that encoded before the second write must not clear it.
        assert!(!coll.mark_clean(encoded_at));
        assert!(coll.is_dirty());
        assert!(coll.mark_clean(coll.generation()));
        assert!(!coll.is_dirty());
    }

    #[test]
    fn test_merge_persisted_memory_wins() {
        let mut coll = settings();
        assert!(!coll.is_hydrated());
        coll.write("volume", Entry::new(json!(0.2), 10, 0)).unwrap();

        let mut persisted = BTreeMap::new();
        persisted.insert("volume".to_string(), Entry::new(json!(0.9), 1, 0));
        persisted.insert("theme".to_string(), Entry::new(json!("dark"), 1, 0));
        persisted.insert("stale".to_string(), Entry::new(json!(true), 1, 1));

        assert_eq!(coll.merge_persisted(persisted, 100), 1);
        assert!(coll.is_hydrated());
        assert_eq!(coll.read("volume", 100).unwrap().value, json!(0.2));
        assert_eq!(coll.read("theme", 100).unwrap().value, json!("dark"));
        assert!(coll.read("stale", 100).is_none());
    }

    #[test]
    fn test_memory_only_collection_starts_hydrated() {
        let config = CollectionConfig {
            persistent: false,
            ..Default::default()
        };
        assert!(Collection::configure("scratch", config).is_hydrated());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut coll = settings();
        coll.write("a", Entry::new(json!(1), 0, 0)).unwrap();
        let snap = coll.snapshot();
        coll.write("b", Entry::new(json!(2), 0, 0)).unwrap();
        coll.remove("a");
        coll.restore(snap.clone());
        assert_eq!(coll.entries(), &snap);
    }

    #[test]
    fn test_stats_reflect_contents() {
        let mut coll = settings();
        coll.write("a", Entry::new(json!("xy"), 0, 0)).unwrap();
        coll.touch(99);
        let stats = coll.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 4);
        assert!(stats.dirty);
        assert_eq!(stats.last_access, 99);
    }
}
