// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide replicator façade.
//!
//! A [`Replicator`] composes the shard registry, the client pool, the
//! update server, and the cleaner. It is an explicit value, not a global:
//! tests and multi-tenant embedders construct several in one process on
//! different ports.
//!
//! # Shard lifecycle
//!
//! [`add_shard`](Replicator::add_shard) publishes a new
//! [`ReplicatedDb`](crate::shard::ReplicatedDb) and, for Followers and
//! Observers, spawns its pull loop. [`remove_shard`](Replicator::remove_shard)
//! unpublishes, signals shutdown, and then blocks until every outstanding
//! holder has dropped its reference, so no background task ever touches a
//! removed shard's store. Callers that kept the handle returned by
//! `add_shard` must drop it before removing, or removal keeps waiting
//! (logged every 200 ms).

use crate::batch::WriteBatch;
use crate::client::ClientPool;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::registry::ShardRegistry;
use crate::server::UpdateServer;
use crate::shard::{NoOpResetHook, ReplicaRole, ReplicatedDb, UpstreamResetHook};
use crate::store::Store;
use crate::cleaner::Cleaner;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long `remove_shard` sleeps between holder-drain checks.
const REMOVE_REF_WAIT: Duration = Duration::from_millis(200);

/// Per-process replication engine instance.
pub struct Replicator {
    config: Arc<ReplicatorConfig>,
    registry: Arc<ShardRegistry>,
    client_pool: Arc<ClientPool>,
    server: UpdateServer,
    cleaner: Cleaner,
    reset_hook: Arc<dyn UpstreamResetHook>,
}

impl Replicator {
    /// Start a replicator with a no-op upstream-reset hook.
    pub async fn new(config: ReplicatorConfig) -> Result<Self> {
        Self::with_reset_hook(config, Arc::new(NoOpResetHook)).await
    }

    /// Start a replicator wired to an external cluster controller through
    /// `reset_hook`. Binds the update server and spawns the cleaner.
    pub async fn with_reset_hook(
        config: ReplicatorConfig,
        reset_hook: Arc<dyn UpstreamResetHook>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(ShardRegistry::new());
        let client_pool = Arc::new(ClientPool::new(config.num_io_threads));
        let server = UpdateServer::bind(Arc::clone(&config), Arc::clone(&registry)).await?;
        let cleaner = Cleaner::start(Arc::clone(&config));

        info!(addr = %server.local_addr(), "replicator started");
        Ok(Self {
            config,
            registry,
            client_pool,
            server,
            cleaner,
            reset_hook,
        })
    }

    /// Address the update server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Publish a shard and, for Follower/Observer roles, start its pull
    /// loop. Returns the shard handle for introspection; drop it before
    /// calling [`remove_shard`](Self::remove_shard).
    pub async fn add_shard(
        &self,
        name: &str,
        store: Arc<dyn Store>,
        role: ReplicaRole,
        upstream_addr: Option<SocketAddr>,
    ) -> Result<Arc<ReplicatedDb>> {
        let db = ReplicatedDb::new(
            name,
            store,
            role,
            upstream_addr,
            Arc::clone(&self.config),
            Arc::clone(&self.reset_hook),
        );

        if !self.registry.add(name, Arc::clone(&db)) {
            return Err(ReplicatorError::AlreadyExists(name.to_string()));
        }

        if role != ReplicaRole::Leader {
            tokio::spawn(Arc::clone(&db).pull_from_upstream(Arc::clone(&self.client_pool)));
        }
        self.cleaner.track(&db);

        info!(shard = name, role = %role, "shard added");
        Ok(db)
    }

    /// Unpublish a shard, cancel its background work, and wait for every
    /// outstanding holder to drop.
    pub async fn remove_shard(&self, name: &str) -> Result<()> {
        let Some(db) = self.registry.remove(name) else {
            return Err(ReplicatorError::ShardNotFound(name.to_string()));
        };

        db.begin_shutdown();
        let weak = Arc::downgrade(&db);
        drop(db);

        while weak.strong_count() > 0 {
            info!(
                shard = name,
                wait_ms = REMOVE_REF_WAIT.as_millis() as u64,
                "shard is still held elsewhere, waiting"
            );
            tokio::time::sleep(REMOVE_REF_WAIT).await;
        }

        info!(shard = name, "shard removed");
        Ok(())
    }

    /// Write a batch to a shard's leader replica.
    pub async fn write(&self, name: &str, batch: WriteBatch) -> Result<u64> {
        let Some(db) = self.registry.get(name) else {
            return Err(ReplicatorError::ShardNotFound(name.to_string()));
        };
        db.write(batch).await
    }

    /// Canonical state snapshot of a shard.
    pub fn introspect(&self, name: &str) -> Result<String> {
        self.registry
            .get(name)
            .map(|db| db.introspect())
            .ok_or_else(|| ReplicatorError::ShardNotFound(name.to_string()))
    }

    /// Shard handle, if published.
    pub fn shard(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.registry.get(name)
    }

    pub fn num_shards(&self) -> usize {
        self.registry.len()
    }

    /// Graceful teardown: drain the registry, stop the cleaner, stop the
    /// server, and join its accept loop.
    pub async fn shutdown(&mut self) {
        info!("shutting down replicator");

        let drained = self.registry.clear();
        for db in &drained {
            db.begin_shutdown();
        }
        for db in drained {
            let weak = Arc::downgrade(&db);
            drop(db);
            while weak.strong_count() > 0 {
                tokio::time::sleep(REMOVE_REF_WAIT).await;
            }
        }

        self.cleaner.stop_and_wait().await;
        self.server.stop().await;
        self.client_pool.clear();
        info!("replicator stopped");
    }
}
