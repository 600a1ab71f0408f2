//! Metrics for observability.
//!
//! Exports Prometheus-compatible series through the `metrics` facade:
//! pull-loop progress, serve-side reply sizes, 2-ACK write outcomes, and
//! upstream-reset attempts. Counters end in `_total`; histograms record
//! seconds. Every series carries a `shard` label (or `peer` for transport
//! errors); the backend installed by the embedding process decides where
//! they go.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a pull-loop RPC being issued.
pub fn record_pull_request(shard: &str) {
    counter!("replicator_pull_requests_total", "shard" => shard.to_string()).increment(1);
}

/// Record a pull that brought back and applied updates.
pub fn record_pull_success(shard: &str, num_updates: usize, bytes: usize) {
    counter!("replicator_pull_requests_success_total", "shard" => shard.to_string()).increment(1);
    counter!("replicator_in_num_updates_total", "shard" => shard.to_string())
        .increment(num_updates as u64);
    counter!("replicator_in_bytes_total", "shard" => shard.to_string()).increment(bytes as u64);
}

/// Record a pull that returned an empty batch.
pub fn record_pull_no_updates(shard: &str) {
    counter!("replicator_pull_requests_no_updates_total", "shard" => shard.to_string()).increment(1);
}

/// Record a failed pull (transport error, refused request, malformed batch).
pub fn record_pull_failure(shard: &str) {
    counter!("replicator_pull_requests_failure_total", "shard" => shard.to_string()).increment(1);
}

/// Record end-to-end latency of one pull iteration.
pub fn record_pull_latency(shard: &str, latency: Duration) {
    histogram!("replicator_pull_latency_seconds", "shard" => shard.to_string())
        .record(latency.as_secs_f64());
}

/// Record an upstream-reset request handed to the injected hook.
pub fn record_reset_upstream_attempt(shard: &str) {
    counter!("replicator_reset_upstream_attempted_total", "shard" => shard.to_string()).increment(1);
}

/// Record a leader write that completed successfully.
pub fn record_write_success(shard: &str) {
    counter!("replicator_write_success_total", "shard" => shard.to_string()).increment(1);
}

/// Record a sync-one-ack write that timed out waiting for a follower.
pub fn record_write_timeout(shard: &str) {
    counter!("replicator_write_wait_timeout_total", "shard" => shard.to_string()).increment(1);
}

/// Record a shard entering the degraded ack deadline.
pub fn record_two_ack_degraded(shard: &str) {
    counter!("replicator_write_two_ack_degraded_total", "shard" => shard.to_string()).increment(1);
}

/// Record a shard recovering to the normal ack deadline.
pub fn record_two_ack_recovered(shard: &str) {
    counter!("replicator_write_two_ack_recovered_total", "shard" => shard.to_string()).increment(1);
}

/// Record a pull served on behalf of an Observer (whose acks never count).
pub fn record_observer_request(shard: &str) {
    counter!("replicator_handle_observer_requests_total", "shard" => shard.to_string()).increment(1);
}

/// Record a served `GetUpdates` reply.
pub fn record_reply_updates(shard: &str, num_updates: usize, bytes: usize, latency: Duration) {
    counter!("replicator_out_num_updates_total", "shard" => shard.to_string())
        .increment(num_updates as u64);
    counter!("replicator_out_bytes_total", "shard" => shard.to_string()).increment(bytes as u64);
    histogram!("replicator_reply_updates_latency_seconds", "shard" => shard.to_string())
        .record(latency.as_secs_f64());
}

/// Record a failure to establish or reuse a peer connection.
pub fn record_connection_error(peer: &str) {
    counter!("replicator_connection_errors_total", "peer" => peer.to_string()).increment(1);
}

/// Record a shard's current sequence cursor.
pub fn set_shard_seq(shard: &str, seq: u64) {
    gauge!("replicator_cur_seq_no", "shard" => shard.to_string()).set(seq as f64);
}

/// Record the number of shards compacted in one cleaner sweep.
pub fn record_cleaner_sweep(compacted: usize) {
    counter!("replicator_cleaner_sweeps_total").increment(1);
    if compacted > 0 {
        counter!("replicator_cleaner_compacted_total").increment(compacted as u64);
    }
}
