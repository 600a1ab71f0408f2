//! Write batches and wire update batches.
//!
//! Two batch shapes exist in the engine:
//!
//! - [`WriteBatch`]: what a client hands to the write path. Contains one or
//!   more operations; applying a batch of `k` operations advances the
//!   store's sequence by `k`.
//! - [`UpdateBatch`]: what travels between replicas. Each payload reproduces
//!   exactly one sequence when applied, so `payloads[i]` corresponds to
//!   sequence `from_seq + i + 1` and `to_seq - from_seq == payloads.len()`
//!   always holds.

use serde::{Deserialize, Serialize};

/// A single key-value operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered group of operations applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<Op>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a put. Builder-style, so writes read naturally at call sites.
    pub fn put(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(Op::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Append a delete.
    pub fn delete(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.ops.push(Op::Delete { key: key.into() });
        self
    }

    /// Number of operations; equals the sequence advance on apply.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }

    /// Wrap one operation into a single-sequence batch.
    pub(crate) fn from_op(op: Op) -> Self {
        Self { ops: vec![op] }
    }

    /// Encode for storage in a per-sequence update log or for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode a payload received from an upstream replica.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// A contiguous run of per-sequence payloads shipped between replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBatch {
    /// The requester's cursor: everything in `payloads` is strictly after it.
    pub from_seq: u64,
    /// Sequence of the last payload; equals `from_seq` for an empty batch.
    pub to_seq: u64,
    /// `payloads[i]` reproduces sequence `from_seq + i + 1` when applied.
    pub payloads: Vec<Vec<u8>>,
}

impl UpdateBatch {
    /// A batch carrying nothing: the upstream had no sequences after
    /// `from_seq` within the long-poll window.
    pub fn empty(from_seq: u64) -> Self {
        Self {
            from_seq,
            to_seq: from_seq,
            payloads: Vec::new(),
        }
    }

    /// Assemble a batch; `to_seq` is derived so the length invariant holds
    /// by construction.
    pub fn new(from_seq: u64, payloads: Vec<Vec<u8>>) -> Self {
        let to_seq = from_seq + payloads.len() as u64;
        Self {
            from_seq,
            to_seq,
            payloads,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Absolute sequence of `payloads[index]`.
    pub fn seq_of(&self, index: usize) -> u64 {
        self.from_seq + index as u64 + 1
    }

    /// Check the wire invariant on a batch received from a peer. A decoded
    /// batch may have been assembled by a buggy or hostile upstream.
    pub fn is_consistent(&self) -> bool {
        self.to_seq.wrapping_sub(self.from_seq) == self.payloads.len() as u64
            && self.to_seq >= self.from_seq
    }

    /// Total payload bytes, for metrics.
    pub fn total_bytes(&self) -> usize {
        self.payloads.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_batch_builder() {
        let batch = WriteBatch::new()
            .put(b"k1".to_vec(), b"v1".to_vec())
            .put(b"k2".to_vec(), b"v2".to_vec())
            .delete(b"k1".to_vec());

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert!(matches!(batch.ops()[2], Op::Delete { .. }));
    }

    #[test]
    fn test_write_batch_codec_roundtrip() {
        let batch = WriteBatch::new()
            .put(b"key".to_vec(), b"value".to_vec())
            .delete(b"gone".to_vec());

        let bytes = batch.encode().unwrap();
        let decoded = WriteBatch::decode(&bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_write_batch_decode_garbage_fails() {
        assert!(WriteBatch::decode(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_empty_update_batch() {
        let batch = UpdateBatch::empty(42);
        assert!(batch.is_empty());
        assert_eq!(batch.from_seq, 42);
        assert_eq!(batch.to_seq, 42);
        assert!(batch.is_consistent());
    }

    #[test]
    fn test_update_batch_invariant_by_construction() {
        let batch = UpdateBatch::new(10, vec![vec![1], vec![2], vec![3]]);
        assert_eq!(batch.to_seq, 13);
        assert_eq!(batch.len(), 3);
        assert!(batch.is_consistent());
        assert_eq!(batch.seq_of(0), 11);
        assert_eq!(batch.seq_of(2), 13);
    }

    #[test]
    fn test_update_batch_detects_forged_to_seq() {
        let mut batch = UpdateBatch::new(10, vec![vec![1], vec![2]]);
        batch.to_seq = 99;
        assert!(!batch.is_consistent());

        // to_seq running backwards is also malformed
        batch.to_seq = 5;
        assert!(!batch.is_consistent());
    }

    #[test]
    fn test_update_batch_total_bytes() {
        let batch = UpdateBatch::new(0, vec![vec![0; 4], vec![0; 6]]);
        assert_eq!(batch.total_bytes(), 10);
    }
}
