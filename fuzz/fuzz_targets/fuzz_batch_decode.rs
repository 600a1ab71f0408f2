//! Fuzz target for the write-batch codec.
//!
//! `WriteBatch::decode` must never panic on arbitrary input, and anything
//! it accepts must re-encode and decode to the same batch.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shard_replicator::WriteBatch;

fuzz_target!(|data: &[u8]| {
    if let Ok(batch) = WriteBatch::decode(data) {
        let encoded = batch.encode().expect("accepted batch must re-encode");
        let decoded = WriteBatch::decode(&encoded).expect("re-encoded batch must decode");
        assert_eq!(decoded, batch);
    }
});
