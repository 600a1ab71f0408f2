// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background cleaner: periodic compaction of idle shard state.
//!
//! The cleaner tracks every shard through a weak reference, so it never
//! extends a shard's lifetime past `remove_shard`. Each tick it drops dead
//! entries and asks shards that have been idle past the configured
//! threshold to purge waiter-table scratch left behind by writers that
//! timed out.

use crate::config::ReplicatorConfig;
use crate::metrics;
use crate::shard::ReplicatedDb;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Low-frequency sweeper over the registry's shards.
pub struct Cleaner {
    shards: Arc<Mutex<Vec<Weak<ReplicatedDb>>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Cleaner {
    /// Spawn the cleaner task.
    pub fn start(config: Arc<ReplicatorConfig>) -> Self {
        let shards: Arc<Mutex<Vec<Weak<ReplicatedDb>>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(Arc::clone(&shards), config, shutdown_rx));
        Self {
            shards,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Track a shard. The cleaner holds only a weak reference.
    pub fn track(&self, db: &Arc<ReplicatedDb>) {
        self.shards.lock().push(Arc::downgrade(db));
    }

    /// Number of live tracked shards.
    pub fn tracked(&self) -> usize {
        self.shards
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Signal the cleaner to stop and join its task.
    pub async fn stop_and_wait(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(
    shards: Arc<Mutex<Vec<Weak<ReplicatedDb>>>>,
    config: Arc<ReplicatorConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let idle_threshold = Duration::from_millis(config.idle_compact_threshold_ms);
    let mut tick = tokio::time::interval(Duration::from_millis(config.cleaner_interval_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                sweep(&shards, idle_threshold);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("cleaner stopped");
}

fn sweep(shards: &Mutex<Vec<Weak<ReplicatedDb>>>, idle_threshold: Duration) {
    let mut guard = shards.lock();
    guard.retain(|weak| weak.strong_count() > 0);

    let mut compacted = 0usize;
    for weak in guard.iter() {
        let Some(db) = weak.upgrade() else { continue };
        if db.idle_for() < idle_threshold {
            continue;
        }
        let purged = db.compact();
        if purged > 0 {
            compacted += 1;
            debug!(shard = %db.name(), purged, "compacted idle shard state");
        }
    }
    metrics::record_cleaner_sweep(compacted);
}
