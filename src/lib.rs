//! # Shard Replicator
//!
//! A per-shard asynchronous replication engine for embedded key-value
//! stores that expose a monotonically increasing write sequence number and
//! contiguous batch reads by sequence.
//!
//! Writes flow from a designated Leader replica to Follower/Observer
//! replicas over a pull-based RPC protocol. Chain topologies work out of
//! the box (a follower may pull from another follower), a sync-one-ack
//! mode lets a leader write block until one Follower has caught up, and a
//! no-updates heuristic detects degenerate upstream wiring and asks an
//! injected hook to fix it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                              Replicator                                │
//! │                                                                        │
//! │  ┌───────────────┐   ┌──────────────────────┐   ┌──────────────────┐   │
//! │  │ ShardRegistry │──▶│ ReplicatedDb (per    │◀──│ UpdateServer     │   │
//! │  │ name → shard  │   │ shard: write path,   │   │ GetUpdates +     │   │
//! │  └───────────────┘   │ pull loop, ack table)│   │ follower acks    │   │
//! │         ▲            └──────────┬───────────┘   └──────────────────┘   │
//! │         │                       │ pulls via                            │
//! │  ┌──────┴──────┐        ┌───────▼────────┐       ┌────────────────┐    │
//! │  │  Cleaner    │        │   ClientPool   │──────▶│ peer Replicator│    │
//! │  │ (weak refs) │        │ (per-peer TCP) │       │ (UpdateServer) │    │
//! │  └─────────────┘        └────────────────┘       └────────────────┘    │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shard_replicator::{MemStore, ReplicaRole, Replicator, ReplicatorConfig, WriteBatch};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shard_replicator::Result<()> {
//!     let replicator = Replicator::new(ReplicatorConfig::default()).await?;
//!
//!     let store = Arc::new(MemStore::new());
//!     replicator
//!         .add_shard("shard1", store, ReplicaRole::Leader, None)
//!         .await?;
//!
//!     let seq = replicator
//!         .write("shard1", WriteBatch::new().put(b"key".to_vec(), b"value".to_vec()))
//!         .await?;
//!     assert_eq!(seq, 1);
//!     Ok(())
//! }
//! ```
//!
//! A follower on another process points at the leader's replicator port:
//!
//! ```rust,no_run
//! # use shard_replicator::{MemStore, ReplicaRole, Replicator, ReplicatorConfig};
//! # use std::sync::Arc;
//! # async fn follower(replicator: Replicator) -> shard_replicator::Result<()> {
//! let upstream = "10.0.0.7:9091".parse().ok();
//! replicator
//!     .add_shard("shard1", Arc::new(MemStore::new()), ReplicaRole::Follower, upstream)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cleaner;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod replicator;
pub mod resilience;
pub mod server;
pub mod shard;
pub mod store;
pub mod wire;

// Re-exports for convenience
pub use batch::{Op, UpdateBatch, WriteBatch};
pub use config::{ReplicationMode, ReplicatorConfig};
pub use error::{ReplicatorError, Result};
pub use replicator::Replicator;
pub use shard::{NoOpResetHook, ReplicaRole, ReplicatedDb, UpstreamResetHook};
pub use store::{MemStore, Store, StoreError};
