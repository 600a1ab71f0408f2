// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapter: the contract between the replicator and an embedded
//! key-value engine.
//!
//! Any engine that exposes a monotonically increasing write sequence number
//! and contiguous batch reads by sequence can be replicated. The embedder
//! provides an implementation of [`Store`]; the engine never reaches around
//! it. Replication applies payloads received from upstream verbatim via
//! [`Store::write`]; sequence numbers line up because the store is
//! deterministic in sequence assignment for replayed batches.
//!
//! [`MemStore`] is the in-memory reference implementation used by the test
//! suite and by embedders prototyping without a real engine.

use crate::batch::{Op, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by a store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A payload could not be decoded or violated store invariants.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The underlying engine failed to persist the batch.
    #[error("io: {0}")]
    Io(String),
}

/// Capability set over the embedded store.
///
/// Implementations must uphold:
/// - `latest_seq()` is monotonically non-decreasing, 0 when empty;
/// - a batch of `k` operations advances the sequence by exactly `k`;
/// - `updates_since(from)` yields every durable sequence strictly greater
///   than `from`, in order, one entry per sequence, each payload reproducing
///   that sequence when passed back through `write`;
/// - a fresh iterator at the same `from` yields the same prefix until new
///   writes occur.
pub trait Store: Send + Sync + 'static {
    /// Last durable sequence number, 0 if the store is empty.
    fn latest_seq(&self) -> u64;

    /// Apply a batch atomically. Returns the last sequence assigned to the
    /// batch's operations.
    fn write(&self, batch: WriteBatch) -> Result<u64, StoreError>;

    /// All durable sequences strictly greater than `from_seq`, in order.
    fn updates_since(
        &self,
        from_seq: u64,
    ) -> Result<Box<dyn Iterator<Item = (u64, Vec<u8>)> + Send>, StoreError>;
}

#[derive(Default)]
struct MemStoreInner {
    kv: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Per-sequence update log: `log[i]` is the encoded single-op batch that
    /// produced sequence `i + 1`.
    log: Vec<Vec<u8>>,
}

/// In-memory store with deterministic sequence assignment.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key. Test/diagnostic convenience; replication never reads.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().kv.get(key).cloned()
    }

    /// Number of live keys.
    pub fn num_keys(&self) -> usize {
        self.inner.read().kv.len()
    }
}

impl Store for MemStore {
    fn latest_seq(&self) -> u64 {
        self.inner.read().log.len() as u64
    }

    fn write(&self, batch: WriteBatch) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        for op in batch.into_ops() {
            let payload = WriteBatch::from_op(op.clone())
                .encode()
                .map_err(|e| StoreError::Io(e.to_string()))?;
            match op {
                Op::Put { key, value } => {
                    inner.kv.insert(key, value);
                }
                Op::Delete { key } => {
                    inner.kv.remove(&key);
                }
            }
            inner.log.push(payload);
        }
        Ok(inner.log.len() as u64)
    }

    fn updates_since(
        &self,
        from_seq: u64,
    ) -> Result<Box<dyn Iterator<Item = (u64, Vec<u8>)> + Send>, StoreError> {
        let inner = self.inner.read();
        let start = usize::try_from(from_seq).unwrap_or(usize::MAX);
        if start >= inner.log.len() {
            return Ok(Box::new(std::iter::empty()));
        }
        let updates: Vec<(u64, Vec<u8>)> = inner.log[start..]
            .iter()
            .enumerate()
            .map(|(i, payload)| (from_seq + i as u64 + 1, payload.clone()))
            .collect();
        Ok(Box::new(updates.into_iter()))
    }
}
