//! Configuration for the replication engine.
//!
//! One [`ReplicatorConfig`] is passed to [`Replicator::new()`](crate::Replicator::new)
//! per process-side engine instance; it is immutable after construction.
//! All fields have serde defaults, so a partial JSON/YAML document works:
//!
//! ```rust
//! use shard_replicator::config::{ReplicatorConfig, ReplicationMode};
//!
//! let config = ReplicatorConfig {
//!     port: 9091,
//!     replication_mode: ReplicationMode::SyncOneAck,
//!     ..Default::default()
//! };
//! assert_eq!(config.timeout_ms, 2000);
//! ```
//!
//! Every interval in the recognized option set is a plain millisecond count,
//! matching the flag surface this engine grew out of
//! (`replicator_timeout_ms`, `replicator_pull_delay_on_error_ms`, ...).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a leader write completes.
///
/// Serialized as the legacy integer encoding: `1` = async, `2` = sync-one-ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReplicationMode {
    /// The write returns as soon as the local store accepts the batch.
    Async,
    /// The write additionally blocks until one Follower acknowledges the
    /// written sequence, or the shard's current ack deadline elapses.
    /// Observer acknowledgements do not count.
    SyncOneAck,
}

impl Default for ReplicationMode {
    fn default() -> Self {
        ReplicationMode::Async
    }
}

impl From<ReplicationMode> for u8 {
    fn from(mode: ReplicationMode) -> u8 {
        match mode {
            ReplicationMode::Async => 1,
            ReplicationMode::SyncOneAck => 2,
        }
    }
}

impl TryFrom<u8> for ReplicationMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ReplicationMode::Async),
            2 => Ok(ReplicationMode::SyncOneAck),
            other => Err(format!("invalid replication mode {other}, expected 1 or 2")),
        }
    }
}

/// Process-wide replicator configuration. Initialized once, immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// TCP port the update server binds. `0` picks an ephemeral port
    /// (useful in tests; read it back via `Replicator::local_addr()`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Cap on idle pooled connections kept per peer address.
    #[serde(default = "default_num_io_threads")]
    pub num_io_threads: usize,

    /// Sizing hint for server-side handler concurrency. A floor of 16 is
    /// always applied, matching the executor floor of the original engine.
    #[serde(default = "default_executor_threads")]
    pub executor_threads: usize,

    /// How long a pull loop sleeps after a transport error or a refused
    /// request before retrying.
    #[serde(default = "default_pull_delay_on_error_ms")]
    pub pull_delay_on_error_ms: u64,

    /// Ceiling on how long the server holds a long-poll open waiting for
    /// new sequences before answering with an empty batch.
    #[serde(default = "default_max_server_wait_time_ms")]
    pub max_server_wait_time_ms: u64,

    /// Extra slack added to the client-side RPC deadline on top of the
    /// requested server wait, so the server always times out first.
    #[serde(default = "default_client_server_timeout_difference_ms")]
    pub client_server_timeout_difference_ms: u64,

    /// Enable the degenerate-wiring heuristic: a Follower that keeps
    /// receiving empty batches from a non-Leader upstream asks the injected
    /// reset hook to rewire it.
    #[serde(default)]
    pub reset_upstream_on_empty_updates_from_non_leader: bool,

    /// How many consecutive empty pulls from a non-Leader upstream a
    /// Follower tolerates before invoking the reset hook.
    #[serde(default = "default_max_consecutive_no_updates")]
    pub max_consecutive_no_updates_before_upstream_reset: u32,

    /// Write completion mode, see [`ReplicationMode`].
    #[serde(default)]
    pub replication_mode: ReplicationMode,

    /// Normal 2-ACK deadline for a leader write.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Degraded 2-ACK deadline, used after repeated ack timeouts so a dead
    /// follower cannot keep stalling every write for the full deadline.
    #[serde(default = "default_timeout_degraded_ms")]
    pub timeout_degraded_ms: u64,

    /// Number of consecutive ack timeouts before a shard switches to the
    /// degraded deadline. The first successful ack restores the normal one.
    #[serde(default = "default_consecutive_ack_timeout_before_degradation")]
    pub consecutive_ack_timeout_before_degradation: u32,

    /// Cap on payloads returned by a single `GetUpdates` response.
    #[serde(default = "default_max_updates_per_response")]
    pub max_updates_per_response: usize,

    /// Cleaner tick interval.
    #[serde(default = "default_cleaner_interval_ms")]
    pub cleaner_interval_ms: u64,

    /// A shard with no RPC or write activity for this long is eligible for
    /// scratch-state compaction by the cleaner.
    #[serde(default = "default_idle_compact_threshold_ms")]
    pub idle_compact_threshold_ms: u64,
}

fn default_port() -> u16 {
    9091
}

fn default_num_io_threads() -> usize {
    8
}

fn default_executor_threads() -> usize {
    32
}

fn default_pull_delay_on_error_ms() -> u64 {
    100
}

fn default_max_server_wait_time_ms() -> u64 {
    500
}

fn default_client_server_timeout_difference_ms() -> u64 {
    100
}

fn default_max_consecutive_no_updates() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_timeout_degraded_ms() -> u64 {
    500
}

fn default_consecutive_ack_timeout_before_degradation() -> u32 {
    100
}

fn default_max_updates_per_response() -> usize {
    1024
}

fn default_cleaner_interval_ms() -> u64 {
    60_000
}

fn default_idle_compact_threshold_ms() -> u64 {
    300_000
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            num_io_threads: default_num_io_threads(),
            executor_threads: default_executor_threads(),
            pull_delay_on_error_ms: default_pull_delay_on_error_ms(),
            max_server_wait_time_ms: default_max_server_wait_time_ms(),
            client_server_timeout_difference_ms: default_client_server_timeout_difference_ms(),
            reset_upstream_on_empty_updates_from_non_leader: false,
            max_consecutive_no_updates_before_upstream_reset: default_max_consecutive_no_updates(),
            replication_mode: ReplicationMode::default(),
            timeout_ms: default_timeout_ms(),
            timeout_degraded_ms: default_timeout_degraded_ms(),
            consecutive_ack_timeout_before_degradation:
                default_consecutive_ack_timeout_before_degradation(),
            max_updates_per_response: default_max_updates_per_response(),
            cleaner_interval_ms: default_cleaner_interval_ms(),
            idle_compact_threshold_ms: default_idle_compact_threshold_ms(),
        }
    }
}

impl ReplicatorConfig {
    /// Create a config with fast timings for tests. Binds an ephemeral port
    /// when `port` is 0.
    pub fn for_testing(port: u16) -> Self {
        Self {
            port,
            pull_delay_on_error_ms: 10,
            max_server_wait_time_ms: 100,
            client_server_timeout_difference_ms: 100,
            cleaner_interval_ms: 200,
            idle_compact_threshold_ms: 0,
            ..Default::default()
        }
    }

    /// Server-side long-poll ceiling as a `Duration`.
    pub fn max_server_wait(&self) -> Duration {
        Duration::from_millis(self.max_server_wait_time_ms)
    }

    /// Client RPC deadline for a pull carrying the given server wait.
    pub fn client_deadline(&self) -> Duration {
        Duration::from_millis(
            self.max_server_wait_time_ms + self.client_server_timeout_difference_ms,
        )
    }

    /// Backoff applied by the pull loop after an error.
    pub fn pull_error_delay(&self) -> Duration {
        Duration::from_millis(self.pull_delay_on_error_ms)
    }

    /// Concurrency cap for server-side update handlers.
    pub fn handler_permits(&self) -> usize {
        self.executor_threads.max(16)
    }
}
