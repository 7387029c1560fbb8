// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Engine configuration.
//!
//! The collection table is fixed when the engine is built; collections are
//! never added or dropped afterwards. Defaults:
//! - namespace: `lexis`
//! - cache ceiling: 5 MiB
//! - flush interval: 30 s
//! - sync retries: 10 attempts, then dead-letter

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::collection::CollectionConfig;
use crate::error::EngineError;
use crate::sync::SyncPolicy;

const HOUR_MS: u64 = 60 * 60 * 1000;
const DAY_MS: u64 = 24 * HOUR_MS;

/// One row of the collection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    #[serde(default)]
    pub config: CollectionConfig,
}

impl CollectionSpec {
    pub fn new(name: &str, config: CollectionConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix for every storage key.
    pub namespace: String,
    /// Upper bound on the cache layer's estimated size.
    pub cache_ceiling_bytes: usize,
    /// Period of the background flush/sync tick.
    pub flush_interval_ms: u64,
    pub sync: SyncPolicy,
    pub collections: Vec<CollectionSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "lexis".to_string(),
            cache_ceiling_bytes: 5 * 1024 * 1024,
            flush_interval_ms: 30_000,
            sync: SyncPolicy::default(),
            collections: default_collections(),
        }
    }
}

/// The vocabulary trainer's collection table.
pub fn default_collections() -> Vec<CollectionSpec> {
    let base = CollectionConfig::default();
    vec![
        CollectionSpec::new(
            "vocabulary",
            CollectionConfig {
                sync: true,
                ..base.clone()
            },
        ),
        CollectionSpec::new(
            "userProgress",
            CollectionConfig {
                sync: true,
                critical: true,
                ..base.clone()
            },
        ),
        CollectionSpec::new(
            "achievements",
            CollectionConfig {
                sync: true,
                critical: true,
                ..base.clone()
            },
        ),
        CollectionSpec::new(
            "analytics",
            CollectionConfig {
                cached: false,
                compress: true,
                ttl_ms: 30 * DAY_MS,
                ..base.clone()
            },
        ),
        CollectionSpec::new(
            "settings",
            CollectionConfig {
                critical: true,
                ..base.clone()
            },
        ),
        CollectionSpec::new(
            "sessionCache",
            CollectionConfig {
                persistent: false,
                ttl_ms: HOUR_MS,
                ..base
            },
        ),
    ]
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = var, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `LEXIS_*` environment variables.
    ///
    /// `LEXIS_SYNC_MAX_ATTEMPTS=0` disables dead-lettering.
    pub fn from_env() -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Ok(namespace) = std::env::var("LEXIS_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(ceiling) = env_parse("LEXIS_CACHE_CEILING_BYTES") {
            config.cache_ceiling_bytes = ceiling;
        }
        if let Some(interval) = env_parse("LEXIS_FLUSH_INTERVAL_MS") {
            config.flush_interval_ms = interval;
        }
        if let Some(attempts) = env_parse::<u32>("LEXIS_SYNC_MAX_ATTEMPTS") {
            config.sync.max_attempts = (attempts > 0).then_some(attempts);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON configuration. Omitted fields take their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.namespace.is_empty() {
            return Err(EngineError::InvalidConfig("namespace is empty".to_string()));
        }
        if self.cache_ceiling_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "cache ceiling must be positive".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "flush interval must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &self.collections {
            if spec.name.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "collection name is empty".to_string(),
                ));
            }
            // ':' separates collection and key in cache slot keys.
            if spec.name.contains(':') {
                return Err(EngineError::InvalidConfig(format!(
                    "collection name {:?} contains ':'",
                    spec.name
                )));
            }
            // `<namespace>__*` keys belong to the sync queue.
            if spec.name.starts_with('_') {
                return Err(EngineError::InvalidConfig(format!(
                    "collection name {:?} starts with '_', reserved for engine keys",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate collection {:?}",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}
