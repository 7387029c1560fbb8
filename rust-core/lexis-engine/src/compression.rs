// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//! Pluggable compression capability for persisted collections.
//!
//! No real compression ships with the engine. [`Base64Compressor`] is a
//! reversible, text-safe wrapper that occupies the slot so hosts can swap in
//! a real codec without touching the persistence engine.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::PersistError;

/// Reversible transform applied to a collection's encoded bytes when its
/// `compress` flag is set.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    fn compress(&self, plain: &[u8]) -> Vec<u8>;

    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>, PersistError>;
}

/// Placeholder codec: standard base64.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Compressor;

impl Compressor for Base64Compressor {
    fn name(&self) -> &str {
        "base64"
    }

    fn compress(&self, plain: &[u8]) -> Vec<u8> {
        STANDARD.encode(plain).into_bytes()
    }

    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>, PersistError> {
        STANDARD
            .decode(packed)
            .map_err(|e| PersistError::Decode(format!("base64: {e}")))
    }
}

/// Pass-through codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn name(&self) -> &str {
        "identity"
    }

    fn compress(&self, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>, PersistError> {
        Ok(packed.to_vec())
    }
}
