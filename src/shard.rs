// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard replication state machine.
//!
//! A [`ReplicatedDb`] owns one shard's store and everything replication
//! needs to know about it: role, upstream address, sequence cursor, the
//! 2-ACK waiter table, and the timeout-degradation state.
//!
//! # Roles
//!
//! - **Leader** accepts client writes and serves updates to pullers.
//! - **Follower** runs the pull loop; its acknowledgements satisfy
//!   sync-one-ack writes on the leader.
//! - **Observer** runs the pull loop too, but its acknowledgements are
//!   ignored and it never triggers upstream resets.
//!
//! # Write/ack coordination (sync-one-ack)
//!
//! A synchronous write registers a one-shot waiter keyed by the sequence it
//! awaits. The leader's update handler treats a Follower's pull request at
//! `from_seq` as an acknowledgement of everything up to `from_seq` and
//! signals all waiters at or below it. The waiter table also keeps the
//! high-water acked sequence, so registration and the already-acked check
//! happen under one lock and the signal/register race cannot drop an ack.
//!
//! # Pull loop
//!
//! One cooperative task per Follower/Observer shard. Transport errors and
//! refused requests are absorbed into `pull_delay_on_error_ms` backoff; a
//! failed apply retries from the same cursor, never skipping a gap.
//! Persistent empty responses from a non-Leader upstream are the designed
//! signal for degenerate wiring (a follower pulling from itself or from a
//! sibling that has no data) and fire the injected upstream-reset hook.

use crate::batch::{UpdateBatch, WriteBatch};
use crate::client::ClientPool;
use crate::config::{ReplicationMode, ReplicatorConfig};
use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::store::{Store, StoreError};
use crate::wire::{GetUpdatesRequest, ResponseCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn, Instrument};

/// Replica role of a shard within its replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
    Observer,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaRole::Leader => write!(f, "LEADER"),
            ReplicaRole::Follower => write!(f, "FOLLOWER"),
            ReplicaRole::Observer => write!(f, "OBSERVER"),
        }
    }
}

/// Hook invoked when a Follower detects degenerate upstream wiring.
///
/// The engine only *requests* a reset; an external controller (cluster
/// membership service) decides what, if anything, to rewire. Tests pass
/// [`NoOpResetHook`].
pub trait UpstreamResetHook: Send + Sync + 'static {
    fn reset_upstream(&self, shard: &str);
}

/// Reset hook that does nothing.
pub struct NoOpResetHook;

impl UpstreamResetHook for NoOpResetHook {
    fn reset_upstream(&self, _shard: &str) {}
}

/// 2-ACK waiter table. Guarded by a per-shard mutex acquired only for O(1)
/// insert/remove/signal; no suspension happens while it is held.
struct AckWaiters {
    /// Highest sequence any Follower has acknowledged.
    max_acked_seq: u64,
    waiters: BTreeMap<u64, oneshot::Sender<()>>,
}

/// Per-shard replication state machine. See the module docs.
pub struct ReplicatedDb {
    name: String,
    role: ReplicaRole,
    upstream_addr: Option<SocketAddr>,
    store: Arc<dyn Store>,
    config: Arc<ReplicatorConfig>,
    reset_hook: Arc<dyn UpstreamResetHook>,

    cur_seq: AtomicU64,
    current_timeout_ms: AtomicU64,
    consecutive_ack_timeouts: AtomicU32,
    consecutive_no_updates: AtomicU32,
    reset_upstream_attempts: AtomicU64,
    last_activity_ms: AtomicU64,

    acks: Mutex<AckWaiters>,
    /// Broadcast to long-poll handlers whenever a new sequence lands.
    write_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for ReplicatedDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDb")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("upstream_addr", &self.upstream_addr)
            .finish_non_exhaustive()
    }
}

impl ReplicatedDb {
    pub(crate) fn new(
        name: &str,
        store: Arc<dyn Store>,
        role: ReplicaRole,
        upstream_addr: Option<SocketAddr>,
        config: Arc<ReplicatorConfig>,
        reset_hook: Arc<dyn UpstreamResetHook>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cur_seq = store.latest_seq();
        let timeout_ms = config.timeout_ms;
        Arc::new(Self {
            name: name.to_string(),
            role,
            upstream_addr,
            store,
            config,
            reset_hook,
            cur_seq: AtomicU64::new(cur_seq),
            current_timeout_ms: AtomicU64::new(timeout_ms),
            consecutive_ack_timeouts: AtomicU32::new(0),
            consecutive_no_updates: AtomicU32::new(0),
            reset_upstream_attempts: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(epoch_millis()),
            acks: Mutex::new(AckWaiters {
                max_acked_seq: 0,
                waiters: BTreeMap::new(),
            }),
            write_notify: Notify::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.upstream_addr
    }

    /// Last sequence this replica has applied (leader: written).
    pub fn cur_seq(&self) -> u64 {
        self.cur_seq.load(Ordering::Acquire)
    }

    /// Current 2-ACK deadline in effect for this shard.
    pub fn current_replicator_timeout_ms(&self) -> u64 {
        self.current_timeout_ms.load(Ordering::Acquire)
    }

    /// Consecutive empty pulls observed by this replica's pull loop.
    pub fn consecutive_no_updates(&self) -> u32 {
        self.consecutive_no_updates.load(Ordering::Acquire)
    }

    /// How many times this replica asked the reset hook to rewire its
    /// upstream.
    pub fn reset_upstream_attempts(&self) -> u64 {
        self.reset_upstream_attempts.load(Ordering::Acquire)
    }

    /// Canonical state snapshot. The format is stable and consumed by
    /// operational tooling; fields are one per line with 2-space indent.
    pub fn introspect(&self) -> String {
        let upstream = self
            .upstream_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "uninitialized_addr".to_string());
        format!(
            "ReplicatedDB:\n  name: {}\n  ReplicaRole: {}\n  upstream_addr: {}\n  cur_seq_no: {}\n  current_replicator_timeout_ms_: {}\n",
            self.name,
            self.role,
            upstream,
            self.cur_seq(),
            self.current_replicator_timeout_ms(),
        )
    }

    // =========================================================================
    // Write path (Leader)
    // =========================================================================

    /// Apply a batch on the leader. In async mode this returns as soon as
    /// the store accepts the batch; in sync-one-ack mode it then waits for
    /// one Follower acknowledgement up to the shard's current deadline.
    pub async fn write(&self, batch: WriteBatch) -> Result<u64> {
        if self.role != ReplicaRole::Leader {
            return Err(ReplicatorError::WriteToSlave(self.name.clone()));
        }

        let seq = self.store.write(batch)?;
        self.cur_seq.store(seq, Ordering::Release);
        self.touch();
        metrics::set_shard_seq(&self.name, seq);
        // wake long-poll handlers before (possibly) suspending on the ack
        self.write_notify.notify_waiters();

        if self.config.replication_mode == ReplicationMode::Async {
            metrics::record_write_success(&self.name);
            return Ok(seq);
        }

        self.wait_for_follower_ack(seq).await?;
        Ok(seq)
    }

    async fn wait_for_follower_ack(&self, seq: u64) -> Result<()> {
        let rx = {
            let mut acks = self.acks.lock();
            if acks.max_acked_seq >= seq {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                acks.waiters.insert(seq, tx);
                Some(rx)
            }
        };

        let Some(rx) = rx else {
            // a follower already pulled past this sequence
            self.note_ack_success();
            return Ok(());
        };

        let deadline = Duration::from_millis(self.current_timeout_ms.load(Ordering::Acquire));
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(())) => {
                self.note_ack_success();
                Ok(())
            }
            // deadline elapsed, or the table was drained by shard teardown
            _ => {
                self.acks.lock().waiters.remove(&seq);
                self.note_ack_timeout();
                Err(ReplicatorError::TimedOut)
            }
        }
    }

    fn note_ack_success(&self) {
        self.consecutive_ack_timeouts.store(0, Ordering::Release);
        let normal = self.config.timeout_ms;
        if self.current_timeout_ms.swap(normal, Ordering::AcqRel) != normal {
            info!(shard = %self.name, timeout_ms = normal, "ack deadline restored to normal");
            metrics::record_two_ack_recovered(&self.name);
        }
        metrics::record_write_success(&self.name);
    }

    fn note_ack_timeout(&self) {
        metrics::record_write_timeout(&self.name);
        let timeouts = self.consecutive_ack_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        if timeouts >= self.config.consecutive_ack_timeout_before_degradation {
            let degraded = self.config.timeout_degraded_ms;
            if self.current_timeout_ms.swap(degraded, Ordering::AcqRel) != degraded {
                warn!(
                    shard = %self.name,
                    consecutive_timeouts = timeouts,
                    timeout_ms = degraded,
                    "entering degraded ack deadline"
                );
                metrics::record_two_ack_degraded(&self.name);
            }
        }
    }

    /// Register a Follower acknowledgement: signal every waiter at or below
    /// `acked_seq`. Called by the update handler; Observer requests must not
    /// reach this.
    pub(crate) fn note_follower_ack(&self, acked_seq: u64) {
        let mut acks = self.acks.lock();
        if acked_seq > acks.max_acked_seq {
            acks.max_acked_seq = acked_seq;
        }
        let ready: Vec<u64> = acks
            .waiters
            .range(..=acked_seq)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in ready {
            if let Some(tx) = acks.waiters.remove(&seq) {
                let _ = tx.send(());
            }
        }
    }

    // =========================================================================
    // Serve side (long-poll responder)
    // =========================================================================

    /// Serve a `GetUpdates(from_seq, wait_ms)` request: return immediately
    /// if sequences beyond `from_seq` exist, otherwise suspend until a write
    /// lands, the (clamped) wait expires, or the shard shuts down. An empty
    /// batch means "nothing new after the wait".
    pub async fn handle_update_request(
        &self,
        from_seq: u64,
        max_wait_ms: u32,
    ) -> Result<UpdateBatch> {
        self.touch();
        let wait = Duration::from_millis(
            (max_wait_ms as u64).min(self.config.max_server_wait_time_ms),
        );
        let deadline = tokio::time::Instant::now() + wait;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if self.store.latest_seq() > from_seq {
                return self.read_updates(from_seq);
            }
            if *shutdown_rx.borrow() {
                return Ok(UpdateBatch::empty(from_seq));
            }

            let notified = self.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // re-check after arming the notification so a write racing with
            // registration is never lost
            if self.store.latest_seq() > from_seq {
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(UpdateBatch::empty(from_seq));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(UpdateBatch::empty(from_seq));
                    }
                }
            }
        }
    }

    fn read_updates(&self, from_seq: u64) -> Result<UpdateBatch> {
        let updates = self.store.updates_since(from_seq)?;
        let mut payloads = Vec::new();
        let mut expected = from_seq + 1;
        for (seq, payload) in updates.take(self.config.max_updates_per_response) {
            if seq != expected {
                return Err(ReplicatorError::Write(StoreError::Corruption(format!(
                    "update stream gap in shard {}: expected sequence {expected}, got {seq}",
                    self.name
                ))));
            }
            expected += 1;
            payloads.push(payload);
        }
        Ok(UpdateBatch::new(from_seq, payloads))
    }

    // =========================================================================
    // Pull loop (Follower / Observer)
    // =========================================================================

    /// Continuously pull updates from the configured upstream and apply them
    /// in order. Runs until shard shutdown. Leaders never run this.
    pub(crate) async fn pull_from_upstream(self: Arc<Self>, pool: Arc<ClientPool>) {
        let Some(upstream) = self.upstream_addr else {
            warn!(shard = %self.name, "no upstream address configured, pull loop not started");
            return;
        };
        let span = tracing::info_span!("pull_loop", shard = %self.name, upstream = %upstream);
        self.run_pull_loop(upstream, pool).instrument(span).await;
    }

    async fn run_pull_loop(&self, upstream: SocketAddr, pool: Arc<ClientPool>) {
        let mut from_seq = self.store.latest_seq();
        self.cur_seq.store(from_seq, Ordering::Release);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let wait_ms = self.config.max_server_wait_time_ms;
        let client_deadline = self.config.client_deadline();
        let error_delay = self.config.pull_error_delay();

        info!(from_seq, "starting pull loop");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let request = GetUpdatesRequest {
                shard: self.name.clone(),
                from_seq,
                max_wait_ms: wait_ms as u32,
                caller_role: self.role,
            };
            metrics::record_pull_request(&self.name);
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                outcome = fetch_once(&pool, upstream, &request, client_deadline) => outcome,
            };
            metrics::record_pull_latency(&self.name, started.elapsed());

            match outcome {
                Ok(response) if response.code == ResponseCode::Ok => {
                    if response.updates.is_empty() {
                        self.on_empty_updates(response.responder_role);
                    } else if response.updates.from_seq != from_seq
                        || !response.updates.is_consistent()
                    {
                        warn!(
                            from_seq,
                            batch_from = response.updates.from_seq,
                            batch_to = response.updates.to_seq,
                            "malformed update batch from upstream"
                        );
                        metrics::record_pull_failure(&self.name);
                        tokio::time::sleep(error_delay).await;
                    } else {
                        from_seq = self.apply_updates(&response.updates, error_delay).await;
                    }
                }
                Ok(response) => {
                    debug!(
                        code = ?response.code,
                        error = response.error_msg.as_deref().unwrap_or(""),
                        "upstream refused update request"
                    );
                    metrics::record_pull_failure(&self.name);
                    tokio::time::sleep(error_delay).await;
                }
                Err(e) => {
                    debug!(error = %e, "pull failed");
                    metrics::record_pull_failure(&self.name);
                    tokio::time::sleep(error_delay).await;
                }
            }
        }

        info!("pull loop stopped");
    }

    fn on_empty_updates(&self, responder_role: Option<ReplicaRole>) {
        metrics::record_pull_no_updates(&self.name);

        if responder_role == Some(ReplicaRole::Leader) {
            // an idle leader is healthy, not a wiring problem
            self.consecutive_no_updates.store(0, Ordering::Release);
            return;
        }

        let streak = self.consecutive_no_updates.fetch_add(1, Ordering::AcqRel) + 1;
        if self.config.reset_upstream_on_empty_updates_from_non_leader
            && self.role == ReplicaRole::Follower
            && streak >= self.config.max_consecutive_no_updates_before_upstream_reset
        {
            warn!(
                shard = %self.name,
                consecutive_no_updates = streak,
                "requesting upstream reset after repeated empty pulls from non-leader"
            );
            self.reset_upstream_attempts.fetch_add(1, Ordering::AcqRel);
            metrics::record_reset_upstream_attempt(&self.name);
            self.reset_hook.reset_upstream(&self.name);
            self.consecutive_no_updates.store(0, Ordering::Release);
        }
    }

    /// Apply payloads in order, advancing the cursor after each successful
    /// apply. A failed apply leaves the cursor where it is; the same
    /// sequence is retried on the next iteration.
    async fn apply_updates(&self, updates: &UpdateBatch, error_delay: Duration) -> u64 {
        let mut from_seq = updates.from_seq;
        let mut applied_bytes = 0usize;

        for (i, payload) in updates.payloads.iter().enumerate() {
            let seq = updates.seq_of(i);
            let applied = WriteBatch::decode(payload)
                .map_err(|e| StoreError::Corruption(e.to_string()))
                .and_then(|batch| self.store.write(batch));
            match applied {
                Ok(_) => {
                    from_seq = seq;
                    applied_bytes += payload.len();
                    self.cur_seq.store(seq, Ordering::Release);
                    // wake chained pullers long-polling on this replica
                    self.write_notify.notify_waiters();
                }
                Err(e) => {
                    warn!(seq, error = %e, "failed to apply update, retrying from the same cursor");
                    tokio::time::sleep(error_delay).await;
                    break;
                }
            }
        }

        let applied = from_seq - updates.from_seq;
        if applied > 0 {
            self.consecutive_no_updates.store(0, Ordering::Release);
            self.touch();
            metrics::record_pull_success(&self.name, applied as usize, applied_bytes);
            metrics::set_shard_seq(&self.name, from_seq);
        }
        from_seq
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Begin teardown: stop the pull loop at its next suspension point,
    /// complete long-poll waiters with an empty batch, and fail suspended
    /// sync writes with `TimedOut`.
    pub(crate) fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.write_notify.notify_waiters();
        self.acks.lock().waiters.clear();
    }

    /// Drop waiter-table entries whose writers already gave up. Returns the
    /// number of entries purged. Invoked by the cleaner on idle shards.
    pub(crate) fn compact(&self) -> usize {
        let mut acks = self.acks.lock();
        let before = acks.waiters.len();
        acks.waiters.retain(|_, tx| !tx.is_closed());
        before - acks.waiters.len()
    }

    /// Time since the last write, apply, or served request.
    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(epoch_millis().saturating_sub(last))
    }

    fn touch(&self) {
        self.last_activity_ms.store(epoch_millis(), Ordering::Relaxed);
    }
}

async fn fetch_once(
    pool: &ClientPool,
    upstream: SocketAddr,
    request: &GetUpdatesRequest,
    deadline: Duration,
) -> Result<crate::wire::GetUpdatesResponse> {
    let mut client = pool.checkout(upstream).await?;
    match client.get_updates(request, deadline).await {
        Ok(response) => {
            pool.checkin(client);
            Ok(response)
        }
        // the connection is stale; dropping it forces a fresh dial next time
        Err(e) => Err(e),
    }
}

/// Current epoch milliseconds.
fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
