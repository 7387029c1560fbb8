// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Entry codec.
//!
//! An [`Entry`] is a stored value plus its write timestamp, TTL and free-form
//! metadata. Collections persist as a JSON object of `key -> Entry`:
//!
//! ```json
//! { "volume": { "value": 0.8, "writtenAt": 1760000000000, "ttl": 0, "metadata": {} } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PersistError;

/// A stored value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub value: Value,
    /// Epoch milliseconds of the write.
    pub written_at: i64,
    /// Lifetime in milliseconds; 0 means the entry never expires.
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Entry {
    pub fn new(value: Value, written_at: i64, ttl: u64) -> Self {
        Self {
            value,
            written_at,
            ttl,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Epoch milliseconds after which the entry is treated as absent.
    pub fn expires_at(&self) -> Option<i64> {
        (self.ttl > 0).then(|| self.written_at.saturating_add(self.ttl_millis()))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.ttl > 0 && now.saturating_sub(self.written_at) > self.ttl_millis()
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.ttl).unwrap_or(i64::MAX)
    }

    /// Estimated footprint of the value: its serialized JSON length.
    pub fn estimated_size(&self) -> usize {
        value_size(&self.value)
    }
}

/// Serialized JSON length of a value.
pub fn value_size(value: &Value) -> usize {
    // Serializing a `Value` cannot fail: all map keys are strings.
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

/// Encode a collection's full entry map.
pub fn encode_entries(entries: &BTreeMap<String, Entry>) -> Result<Vec<u8>, PersistError> {
    serde_json::to_vec(entries).map_err(PersistError::Encode)
}

/// Decode a collection's full entry map.
pub fn decode_entries(bytes: &[u8]) -> Result<BTreeMap<String, Entry>, PersistError> {
    serde_json::from_slice(bytes).map_err(|e| PersistError::Decode(e.to_string()))
}
