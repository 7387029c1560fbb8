// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Typed collection handles.
//!
//! A [`TypedCollection`] fixes the collection name and value type once, so
//! callers working with one kind of record stop repeating both:
//!
//! ```rust
//! use lexis_engine::{EngineConfig, SetOptions, StoreManager};
//! use lexis_storage::InMemoryBackend;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct Progress { streak: u32, xp: u64 }
//!
//! # tokio_test::block_on(async {
//! let store = StoreManager::new(EngineConfig::default(), InMemoryBackend::new()).unwrap();
//! let progress = store.collection::<Progress>("userProgress").unwrap();
//!
//! progress.set("today", &Progress { streak: 3, xp: 120 }).await.unwrap();
//! assert_eq!(progress.get("today").await.unwrap(), Some(Progress { streak: 3, xp: 120 }));
//! # });
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use lexis_storage::StorageBackend;

use crate::error::EngineError;
use crate::store::{SetOptions, StoreManager};

/// A [`StoreManager`] view bound to one collection and value type.
pub struct TypedCollection<B: StorageBackend, T> {
    store: StoreManager<B>,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<B: StorageBackend, T> Clone for TypedCollection<B, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<B, T> TypedCollection<B, T>
where
    B: StorageBackend,
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(store: StoreManager<B>, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, EngineError> {
        self.store.get(&self.name, key).await
    }

    pub async fn get_or(&self, key: &str, default: T) -> Result<T, EngineError> {
        self.store.get_or(&self.name, key, default).await
    }

    pub async fn set(&self, key: &str, value: &T) -> Result<(), EngineError> {
        self.store.set(&self.name, key, value, SetOptions::default()).await
    }

    pub async fn set_with(&self, key: &str, value: &T, options: SetOptions) -> Result<(), EngineError> {
        self.store.set(&self.name, key, value, options).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        self.store.delete(&self.name, key).await
    }

    /// Every live entry, deserialized. Fails on the first value that does
    /// not fit `T`.
    pub async fn get_all(&self) -> Result<BTreeMap<String, T>, EngineError> {
        self.store
            .get_all(&self.name)
            .await?
            .into_iter()
            .map(|(key, value)| -> Result<(String, T), EngineError> {
                Ok((key, serde_json::from_value(value)?))
            })
            .collect()
    }
}
