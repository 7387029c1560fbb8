// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Shared, size-bounded read-through cache.
//!
//! One [`CacheLayer`] serves every collection, keyed by
//! `"<collection>:<key>"`. Slots hold copies of entries, so evicting a slot
//! never touches the authoritative value in its collection.
//!
//! # Eviction
//!
//! When an incoming slot would push the total estimated size past the
//! ceiling, the least-recently-accessed quarter of the slots (at least one)
//! is dropped in a single pass, and the bound is checked again. A fixed
//! proportional purge keeps the cache from evicting on every write once it
//! is near its limit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::Entry;

#[derive(Debug, Clone)]
struct CacheSlot {
    entry: Entry,
    size: usize,
    last_access: u64,
}

/// Counters and gauges for the cache layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub slots: usize,
    pub bytes: usize,
    pub ceiling: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub eviction_passes: u64,
}

/// Global LRU-ish cache shared by all collections.
#[derive(Debug)]
pub struct CacheLayer {
    slots: HashMap<String, CacheSlot>,
    ceiling: usize,
    total: usize,
    /// Logical access clock; strictly increasing so ties never occur.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    eviction_passes: u64,
}

fn slot_key(collection: &str, key: &str) -> String {
    format!("{collection}:{key}")
}

impl CacheLayer {
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: HashMap::new(),
            ceiling,
            total: 0,
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            eviction_passes: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Return a copy of the cached entry and refresh its access time.
    pub fn get(&mut self, collection: &str, key: &str) -> Option<Entry> {
        let tick = self.next_tick();
        match self.slots.get_mut(&slot_key(collection, key)) {
            Some(slot) => {
                slot.last_access = tick;
                self.hits += 1;
                Some(slot.entry.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Cache a copy of `entry`, evicting first if it would not fit.
    ///
    /// Returns `false` when the entry alone exceeds the ceiling; any stale
    /// slot for the key is dropped in that case.
    pub fn put(&mut self, collection: &str, key: &str, entry: &Entry) -> bool {
        let slot_key = slot_key(collection, key);
        let size = slot_key.len() + entry.estimated_size();

        if let Some(old) = self.slots.remove(&slot_key) {
            self.total -= old.size;
        }

        if size > self.ceiling {
            debug!(slot = %slot_key, size = size, ceiling = self.ceiling, "Entry larger than cache ceiling, not cached");
            return false;
        }

        while self.total + size > self.ceiling && !self.slots.is_empty() {
            self.evict_oldest_quarter();
        }

        let tick = self.next_tick();
        self.total += size;
        self.slots.insert(
            slot_key,
            CacheSlot {
                entry: entry.clone(),
                size,
                last_access: tick,
            },
        );
        true
    }

    pub fn invalidate(&mut self, collection: &str, key: &str) -> bool {
        match self.slots.remove(&slot_key(collection, key)) {
            Some(slot) => {
                self.total -= slot.size;
                true
            }
            None => false,
        }
    }

    /// Drop every slot belonging to `collection`.
    pub fn invalidate_collection(&mut self, collection: &str) -> usize {
        let prefix = format!("{collection}:");
        let before = self.slots.len();
        let mut freed = 0;
        self.slots.retain(|key, slot| {
            let keep = !key.starts_with(&prefix);
            if !keep {
                freed += slot.size;
            }
            keep
        });
        self.total -= freed;
        before - self.slots.len()
    }

    fn evict_oldest_quarter(&mut self) {
        let count = self.slots.len().div_ceil(4);
        let mut by_age: Vec<(u64, String)> = self
            .slots
            .iter()
            .map(|(key, slot)| (slot.last_access, key.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(count) {
            if let Some(slot) = self.slots.remove(&key) {
                self.total -= slot.size;
            }
        }

        self.evictions += count as u64;
        self.eviction_passes += 1;
        debug!(evicted = count, remaining = self.slots.len(), bytes = self.total, "Cache eviction pass");
    }

    pub fn total_size(&self) -> usize {
        self.total
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, collection: &str, key: &str) -> bool {
        self.slots.contains_key(&slot_key(collection, key))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            slots: self.slots.len(),
            bytes: self.total,
            ceiling: self.ceiling,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            eviction_passes: self.eviction_passes,
        }
    }
}
