//! Shard registry: the single point of publication for per-shard state.
//!
//! Maps shard names to shared [`ReplicatedDb`] handles. A name maps to at
//! most one shard within a process at any instant; `add` is
//! insert-if-absent and `remove` unpublishes atomically. Readers never block
//! writers except during the single-instant publish/unpublish (the map is
//! lock-striped).

use crate::shard::ReplicatedDb;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent name → shard map.
#[derive(Default)]
pub struct ShardRegistry {
    shards: DashMap<String, Arc<ReplicatedDb>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a shard. Returns `false` iff a shard with the same name is
    /// already published (the map is left untouched in that case).
    pub fn add(&self, name: &str, db: Arc<ReplicatedDb>) -> bool {
        match self.shards.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(db);
                true
            }
        }
    }

    /// Look up a shard, returning a refcounted handle.
    pub fn get(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.shards.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Unpublish a shard and return the registry's reference. The caller is
    /// responsible for shutting the shard down and awaiting holder drain.
    pub fn remove(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.shards.remove(name).map(|(_, db)| db)
    }

    /// Unpublish everything, returning the drained handles for teardown.
    pub fn clear(&self) -> Vec<Arc<ReplicatedDb>> {
        let drained: Vec<Arc<ReplicatedDb>> = self
            .shards
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shards.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Names of all published shards (unordered snapshot).
    pub fn names(&self) -> Vec<String> {
        self.shards.iter().map(|entry| entry.key().clone()).collect()
    }
}
