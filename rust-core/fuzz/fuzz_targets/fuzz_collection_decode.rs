// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the persisted collection decoder.
// Run with: cargo +nightly fuzz run fuzz_collection_decode
//
// Feeds arbitrary bytes to the decoder in both the plain and the packed
// format. Corrupt blobs must be rejected with an error, and anything that
// decodes must encode and decode again with the same keys.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use lexis_engine::{Base64Compressor, PersistenceEngine, SyncOperation};
use lexis_storage::InMemoryBackend;

fuzz_target!(|data: &[u8]| {
    if data.len() > 8192 {
        return;
    }

    let engine = PersistenceEngine::new(
        Arc::new(InMemoryBackend::new()),
        "fuzz",
        Arc::new(Base64Compressor),
    );

    for compressed in [false, true] {
        if let Ok(entries) = engine.decode(data, compressed) {
            let encoded = engine.encode(&entries, compressed).expect("decoded entries re-encode");
            let again = engine.decode(&encoded, compressed).expect("re-encoded entries decode");
            assert_eq!(entries.len(), again.len());
        }
    }

    // The persisted sync queue is parsed from the same untrusted storage.
    let _ = serde_json::from_slice::<Vec<SyncOperation>>(data);
});
