// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors carry the stable identifiers callers branch on. Write-on-follower
//! and registry misses are ordinary result variants, not panics.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Peer unreachable, connection dropped, RPC deadline hit |
//! | `TimedOut` | Yes | 2-ACK deadline exceeded; the write itself was applied |
//! | `Write` | Yes | Store rejected the batch (recoverable at the caller) |
//! | `ShardNotFound` | No | Registry miss |
//! | `AlreadyExists` | No | `add_shard` collision |
//! | `WriteToSlave` | No | Write attempted on a non-leader replica |
//! | `Config` | No | Configuration invalid |
//!
//! # Propagation
//!
//! Pull-loop errors never reach users: they are swallowed into
//! backoff-and-retry and counted in metrics. Handler errors become RPC
//! response codes. Write-path errors surface to the caller with no retry.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur while operating the replicator.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// No shard with this name is published in the registry.
    #[error("shard not found: {0}")]
    ShardNotFound(String),

    /// `add_shard` found an existing shard with the same name.
    #[error("shard already exists: {0}")]
    AlreadyExists(String),

    /// A write was attempted on a Follower or Observer replica.
    /// Only the Leader accepts client writes.
    #[error("write to non-leader replica of shard {0}")]
    WriteToSlave(String),

    /// The embedded store rejected the batch.
    #[error("store write failed: {0}")]
    Write(#[from] StoreError),

    /// In sync-one-ack mode, no Follower acknowledged the written sequence
    /// within the shard's current ack deadline. The message text is relied
    /// upon by operational tooling; do not change it.
    #[error("Failed to receive ack from follower")]
    TimedOut,

    /// RPC-layer failure talking to a peer. Only ever observed by the pull
    /// loop, which absorbs it into backoff; never user-visible.
    #[error("transport error ({peer}): {message}")]
    Transport { peer: String, message: String },

    /// Invalid configuration detected at startup (e.g. the replicator port
    /// cannot be bound).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ReplicatorError {
    /// Create a transport error for a peer.
    pub fn transport(peer: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            message: message.into(),
        }
    }

    /// Check if the failed operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::TimedOut => true,
            Self::Write(_) => true,
            Self::ShardNotFound(_) => false,
            Self::AlreadyExists(_) => false,
            Self::WriteToSlave(_) => false,
            Self::Config(_) => false,
        }
    }
}
