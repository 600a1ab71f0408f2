//! Shared test utilities for integration and chaos tests.
//!
//! Every test runs fully in-process: each `TestHost` is a complete
//! replicator (registry + update server + cleaner) bound to an ephemeral
//! loopback port, so topologies never collide across concurrently running
//! tests.

#![allow(dead_code)]

use shard_replicator::{MemStore, Replicator, ReplicatorConfig, Store, WriteBatch};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One replication engine instance, standing in for a process.
pub struct TestHost {
    pub replicator: Replicator,
}

impl TestHost {
    pub async fn new() -> Self {
        Self::with_config(ReplicatorConfig::for_testing(0)).await
    }

    pub async fn with_config(config: ReplicatorConfig) -> Self {
        let replicator = Replicator::new(config)
            .await
            .expect("failed to start replicator");
        Self { replicator }
    }

    /// Loopback address other hosts use as `upstream_addr`.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.replicator.local_addr().port(),
        )
    }
}

/// Batch with two puts: `{i}key -> {i}value`, `{i}key2 -> {i}value2`.
pub fn double_put(i: u32) -> WriteBatch {
    WriteBatch::new()
        .put(format!("{i}key"), format!("{i}value"))
        .put(format!("{i}key2"), format!("{i}value2"))
}

/// Batch with one put: `{i}key -> {i}value`.
pub fn single_put(i: u32) -> WriteBatch {
    WriteBatch::new().put(format!("{i}key"), format!("{i}value"))
}

/// Batch with one put using a custom key/value stem: `{i}{key} -> {i}{value}`.
pub fn keyed_put(i: u32, key: &str, value: &str) -> WriteBatch {
    WriteBatch::new().put(format!("{i}{key}"), format!("{i}{value}"))
}

/// Poll a condition until it holds or the timeout expires.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait for a store to reach a sequence number.
pub async fn wait_for_seq(store: &Arc<MemStore>, seq: u64, timeout: Duration) -> bool {
    let store = Arc::clone(store);
    wait_until(move || store.latest_seq() >= seq, timeout).await
}

/// Assert every `{i}key -> {i}value` pair (and `key2` when `double` is set)
/// is readable in a store.
pub fn assert_keys(store: &MemStore, n_keys: u32, double: bool) {
    for i in 0..n_keys {
        assert_eq!(
            store.get(format!("{i}key").as_bytes()),
            Some(format!("{i}value").into_bytes()),
            "missing {i}key"
        );
        if double {
            assert_eq!(
                store.get(format!("{i}key2").as_bytes()),
                Some(format!("{i}value2").into_bytes()),
                "missing {i}key2"
            );
        }
    }
}
