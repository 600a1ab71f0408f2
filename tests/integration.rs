// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests: shard lifecycle and replication topologies.
//!
//! Each test stands up complete replicator instances on ephemeral loopback
//! ports and drives them through the public API only.
//!
//! # Test Organization
//! - `lifecycle_*` - add/remove/write error paths and introspection
//! - `linear_*` / `tree_*` / `chain_*` - replication topologies
//! - `stress_*` - many shards spread over several hosts

mod common;

use common::{assert_keys, double_put, keyed_put, single_put, wait_for_seq, TestHost};
use shard_replicator::{MemStore, ReplicaRole, ReplicatorError, Store, WriteBatch};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifecycle_add_remove_write_and_introspect() {
    let host = TestHost::new().await;
    let replicator = &host.replicator;

    assert!(matches!(
        replicator.remove_shard("non_exist_db").await.unwrap_err(),
        ReplicatorError::ShardNotFound(_)
    ));
    assert!(matches!(
        replicator
            .write("non_exist_db", WriteBatch::new())
            .await
            .unwrap_err(),
        ReplicatorError::ShardNotFound(_)
    ));

    let master_store = Arc::new(MemStore::new());
    let slave_store = Arc::new(MemStore::new());

    let master = replicator
        .add_shard("master", master_store.clone(), ReplicaRole::Leader, None)
        .await
        .unwrap();
    assert!(matches!(
        replicator
            .add_shard("master", master_store.clone(), ReplicaRole::Leader, None)
            .await
            .unwrap_err(),
        ReplicatorError::AlreadyExists(_)
    ));
    let slave = replicator
        .add_shard(
            "slave",
            slave_store.clone(),
            ReplicaRole::Follower,
            Some(host.addr()),
        )
        .await
        .unwrap();

    // writes must go to the leader replica
    assert!(matches!(
        replicator.write("slave", double_put(0)).await.unwrap_err(),
        ReplicatorError::WriteToSlave(_)
    ));
    assert!(matches!(
        slave.write(double_put(0)).await.unwrap_err(),
        ReplicatorError::WriteToSlave(_)
    ));
    assert_eq!(replicator.write("master", double_put(0)).await.unwrap(), 2);

    let expected_master = "ReplicatedDB:\n\
  name: master\n\
  ReplicaRole: LEADER\n\
  upstream_addr: uninitialized_addr\n\
  cur_seq_no: 2\n\
  current_replicator_timeout_ms_: 2000\n";
    let expected_slave = "ReplicatedDB:\n\
  name: slave\n\
  ReplicaRole: FOLLOWER\n\
  upstream_addr: 127.0.0.1\n\
  cur_seq_no: 0\n\
  current_replicator_timeout_ms_: 2000\n";
    assert_eq!(master.introspect(), expected_master);
    assert_eq!(slave.introspect(), expected_slave);
    assert_eq!(replicator.introspect("master").unwrap(), expected_master);

    assert_eq!(master.role(), ReplicaRole::Leader);
    assert_eq!(slave.role(), ReplicaRole::Follower);

    drop(master);
    drop(slave);
    replicator.remove_shard("slave").await.unwrap();
    replicator.remove_shard("master").await.unwrap();
    assert!(matches!(
        replicator.remove_shard("master").await.unwrap_err(),
        ReplicatorError::ShardNotFound(_)
    ));
    assert!(matches!(
        replicator.write("master", double_put(0)).await.unwrap_err(),
        ReplicatorError::ShardNotFound(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_one_leader_one_follower() {
    let master_host = TestHost::new().await;
    let slave_host = TestHost::new().await;

    let master_store = Arc::new(MemStore::new());
    let slave_store = Arc::new(MemStore::new());

    let _ = master_host
        .replicator
        .add_shard("shard1", master_store.clone(), ReplicaRole::Leader, None)
        .await
        .unwrap();
    let _ = slave_host
        .replicator
        .add_shard(
            "shard1",
            slave_store.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();

    assert_eq!(master_store.latest_seq(), 0);
    assert_eq!(slave_store.latest_seq(), 0);

    let n_keys = 100u32;
    for i in 0..n_keys {
        master_host
            .replicator
            .write("shard1", double_put(i))
            .await
            .unwrap();
        assert_eq!(master_store.latest_seq(), (i as u64) * 2 + 2);
    }

    assert!(wait_for_seq(&slave_store, n_keys as u64 * 2, Duration::from_secs(10)).await);
    assert_eq!(slave_store.latest_seq(), n_keys as u64 * 2);
    assert_keys(&slave_store, n_keys, true);

    // after the leader shard is unpublished, direct writes to its store no
    // longer propagate
    master_host.replicator.remove_shard("shard1").await.unwrap();
    for i in 0..n_keys {
        master_store
            .write(keyed_put(i, "new_key", "new_value"))
            .unwrap();
    }
    assert_eq!(master_store.latest_seq(), n_keys as u64 * 3);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(slave_store.latest_seq(), n_keys as u64 * 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tree_two_followers_pull_same_leader() {
    let master_host = TestHost::new().await;
    let slave_host_1 = TestHost::new().await;
    let slave_host_2 = TestHost::new().await;

    let master_store = Arc::new(MemStore::new());
    let slave_store_1 = Arc::new(MemStore::new());
    let slave_store_2 = Arc::new(MemStore::new());

    let _ = master_host
        .replicator
        .add_shard("shard1", master_store.clone(), ReplicaRole::Leader, None)
        .await
        .unwrap();
    let _ = slave_host_1
        .replicator
        .add_shard(
            "shard1",
            slave_store_1.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();
    let _ = slave_host_2
        .replicator
        .add_shard(
            "shard1",
            slave_store_2.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();

    let n_keys = 100u32;
    for i in 0..n_keys {
        master_host
            .replicator
            .write("shard1", single_put(i))
            .await
            .unwrap();
        assert_eq!(master_store.latest_seq(), i as u64 + 1);
    }

    assert!(wait_for_seq(&slave_store_1, n_keys as u64, Duration::from_secs(10)).await);
    assert!(wait_for_seq(&slave_store_2, n_keys as u64, Duration::from_secs(10)).await);
    assert_keys(&slave_store_1, n_keys, false);
    assert_keys(&slave_store_2, n_keys, false);

    // removing the leader halts propagation for both followers
    master_host.replicator.remove_shard("shard1").await.unwrap();
    for i in 0..n_keys {
        master_store
            .write(keyed_put(i, "new_key", "new_value"))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(slave_store_1.latest_seq(), n_keys as u64);
    assert_eq!(slave_store_2.latest_seq(), n_keys as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chain_follower_pulls_from_follower() {
    let master_host = TestHost::new().await;
    let slave_host_1 = TestHost::new().await;
    let slave_host_2 = TestHost::new().await;

    let master_store = Arc::new(MemStore::new());
    let slave_store_1 = Arc::new(MemStore::new());
    let slave_store_2 = Arc::new(MemStore::new());

    let _ = master_host
        .replicator
        .add_shard("shard1", master_store.clone(), ReplicaRole::Leader, None)
        .await
        .unwrap();
    // S1 pulls from the leader, S2 pulls from S1
    let _ = slave_host_1
        .replicator
        .add_shard(
            "shard1",
            slave_store_1.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();
    let _ = slave_host_2
        .replicator
        .add_shard(
            "shard1",
            slave_store_2.clone(),
            ReplicaRole::Follower,
            Some(slave_host_1.addr()),
        )
        .await
        .unwrap();

    let n_keys = 100u32;
    for i in 0..n_keys {
        master_host
            .replicator
            .write("shard1", single_put(i))
            .await
            .unwrap();
    }

    assert!(wait_for_seq(&slave_store_2, n_keys as u64, Duration::from_secs(10)).await);
    assert_eq!(slave_store_1.latest_seq(), n_keys as u64);
    assert_keys(&slave_store_1, n_keys, false);
    assert_keys(&slave_store_2, n_keys, false);

    // drop the middle of the chain and keep writing
    slave_host_1
        .replicator
        .remove_shard("shard1")
        .await
        .unwrap();
    for i in 0..n_keys {
        master_host
            .replicator
            .write("shard1", keyed_put(i, "new_key", "new_value"))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(slave_store_1.latest_seq(), n_keys as u64);
    assert_eq!(slave_store_2.latest_seq(), n_keys as u64);

    // re-adding the middle node lets the whole chain catch up
    let _ = slave_host_1
        .replicator
        .add_shard(
            "shard1",
            slave_store_1.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();

    assert!(wait_for_seq(&slave_store_2, 2 * n_keys as u64, Duration::from_secs(10)).await);
    assert_eq!(slave_store_1.latest_seq(), 2 * n_keys as u64);
    for i in 0..n_keys {
        let key = format!("{i}new_key");
        let value = Some(format!("{i}new_value").into_bytes());
        assert_eq!(slave_store_1.get(key.as_bytes()), value);
        assert_eq!(slave_store_2.get(key.as_bytes()), value);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_twenty_shards_over_three_hosts() {
    let hosts = [
        TestHost::new().await,
        TestHost::new().await,
        TestHost::new().await,
    ];
    let n_shards = 20usize;
    let n_keys = 100u32;

    let mut master_stores = Vec::new();
    let mut slave_stores_1 = Vec::new();
    let mut slave_stores_2 = Vec::new();

    for i in 0..n_shards {
        let shard = format!("shard{i}");
        let start = i % hosts.len();

        let master_store = Arc::new(MemStore::new());
        let slave_store_1 = Arc::new(MemStore::new());
        let slave_store_2 = Arc::new(MemStore::new());

        let _ = hosts[start]
            .replicator
            .add_shard(&shard, master_store.clone(), ReplicaRole::Leader, None)
            .await
            .unwrap();
        let _ = hosts[(start + 1) % hosts.len()]
            .replicator
            .add_shard(
                &shard,
                slave_store_1.clone(),
                ReplicaRole::Follower,
                Some(hosts[start].addr()),
            )
            .await
            .unwrap();
        let _ = hosts[(start + 2) % hosts.len()]
            .replicator
            .add_shard(
                &shard,
                slave_store_2.clone(),
                ReplicaRole::Follower,
                Some(hosts[start].addr()),
            )
            .await
            .unwrap();

        master_stores.push(master_store);
        slave_stores_1.push(slave_store_1);
        slave_stores_2.push(slave_store_2);
    }

    // every host is asked to write every shard; only the leader accepts
    for i in 0..n_keys {
        for j in 0..n_shards {
            let shard = format!("shard{j}");
            for host in &hosts {
                match host.replicator.write(&shard, single_put(i)).await {
                    Ok(_) => {}
                    Err(ReplicatorError::WriteToSlave(_)) => {}
                    Err(other) => panic!("unexpected write error: {other}"),
                }
            }
        }
    }

    for i in 0..n_shards {
        assert_eq!(master_stores[i].latest_seq(), n_keys as u64);
        assert!(wait_for_seq(&slave_stores_1[i], n_keys as u64, Duration::from_secs(20)).await);
        assert!(wait_for_seq(&slave_stores_2[i], n_keys as u64, Duration::from_secs(20)).await);

        assert_keys(&master_stores[i], n_keys, false);
        assert_keys(&slave_stores_1[i], n_keys, false);
        assert_keys(&slave_stores_2[i], n_keys, false);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_seq_is_prefix_of_leader_under_concurrent_writes() {
    let master_host = TestHost::new().await;
    let slave_host = TestHost::new().await;

    let master_store = Arc::new(MemStore::new());
    let slave_store = Arc::new(MemStore::new());

    let _ = master_host
        .replicator
        .add_shard("shard1", master_store.clone(), ReplicaRole::Leader, None)
        .await
        .unwrap();
    let _ = slave_host
        .replicator
        .add_shard(
            "shard1",
            slave_store.clone(),
            ReplicaRole::Follower,
            Some(master_host.addr()),
        )
        .await
        .unwrap();

    // sample the follower's cursor while writes are in flight: it must be
    // monotonically non-decreasing and never ahead of the leader
    let mut last_seen = 0u64;
    for i in 0..50u32 {
        master_host
            .replicator
            .write("shard1", double_put(i))
            .await
            .unwrap();
        let slave_seq = slave_store.latest_seq();
        assert!(slave_seq >= last_seen, "follower cursor went backwards");
        assert!(
            slave_seq <= master_store.latest_seq(),
            "follower is ahead of the leader"
        );
        last_seen = slave_seq;
    }

    assert!(wait_for_seq(&slave_store, 100, Duration::from_secs(10)).await);
    assert_keys(&slave_store, 50, true);
}
