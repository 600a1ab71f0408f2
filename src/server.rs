//! Server-side RPC endpoint: serves `GetUpdates` to pulling replicas.
//!
//! One accept loop per [`Replicator`](crate::Replicator); one task per
//! connection. A puller keeps its connection open for the lifetime of its
//! pull loop and runs strict request/response exchanges on it, so the
//! per-connection task is a simple read-handle-write loop until EOF.
//!
//! Follower-ack accounting happens here: a request whose `caller_role` is
//! Follower acknowledges `from_seq` on the addressed shard *before* the
//! long poll begins, which is what unblocks sync-one-ack writers on a
//! leader. Observer requests are counted and otherwise treated the same,
//! but never acknowledge anything.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::registry::ShardRegistry;
use crate::resilience::Bulkhead;
use crate::shard::ReplicaRole;
use crate::wire::{self, GetUpdatesRequest, GetUpdatesResponse, MSG_GET_UPDATES, MSG_UPDATES};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// TCP server answering `GetUpdates` for every shard in the registry.
#[derive(Debug)]
pub struct UpdateServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl UpdateServer {
    /// Bind the configured port and start accepting. With `port` 0 an
    /// ephemeral port is chosen; read it back via [`local_addr`](Self::local_addr).
    pub async fn bind(config: Arc<ReplicatorConfig>, registry: Arc<ShardRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| {
                ReplicatorError::Config(format!("cannot bind replicator port {}: {e}", config.port))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ReplicatorError::Config(format!("cannot read bound address: {e}")))?;

        let bulkhead = Arc::new(Bulkhead::new(config.handler_permits()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_handle = tokio::spawn(accept_loop(listener, registry, bulkhead, shutdown_rx));

        info!(addr = %local_addr, "update server listening");
        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the accept loop. Established connections
    /// drain on their own once the registry empties.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<ShardRegistry>,
    bulkhead: Arc<Bulkhead>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted replication connection");
                    let registry = Arc::clone(&registry);
                    let bulkhead = Arc::clone(&bulkhead);
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        match serve_connection(stream, registry, bulkhead, shutdown_rx).await {
                            Ok(()) => debug!(peer = %peer, "replication connection closed"),
                            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                debug!(peer = %peer, "replication connection closed by peer");
                            }
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "replication connection failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("update server stopped");
}

async fn serve_connection(
    stream: TcpStream,
    registry: Arc<ShardRegistry>,
    bulkhead: Arc<Bulkhead>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut stream = BufStream::new(stream);

    loop {
        let (msg_type, payload) = tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
                continue;
            }
            read = wire::read_message(&mut stream) => read?,
        };

        if msg_type != MSG_GET_UPDATES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected message type {msg_type:#x}"),
            ));
        }
        let request: GetUpdatesRequest = wire::decode(&payload)?;

        let _permit = bulkhead
            .acquire()
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        let response = handle_request(&registry, request).await;

        let body = wire::encode(&response)?;
        wire::write_message(&mut stream, MSG_UPDATES, &body).await?;
    }
}

/// Serve one `GetUpdates` request against the registry.
pub(crate) async fn handle_request(
    registry: &ShardRegistry,
    request: GetUpdatesRequest,
) -> GetUpdatesResponse {
    let Some(db) = registry.get(&request.shard) else {
        return GetUpdatesResponse::shard_not_found(&request.shard);
    };

    // A follower asking for updates after `from_seq` has durably applied
    // everything up to it; on a leader in sync-one-ack mode that is the ack.
    match request.caller_role {
        ReplicaRole::Follower => db.note_follower_ack(request.from_seq),
        ReplicaRole::Observer => metrics::record_observer_request(db.name()),
        ReplicaRole::Leader => {}
    }

    let started = Instant::now();
    match db
        .handle_update_request(request.from_seq, request.max_wait_ms)
        .await
    {
        Ok(updates) => {
            metrics::record_reply_updates(
                db.name(),
                updates.len(),
                updates.total_bytes(),
                started.elapsed(),
            );
            GetUpdatesResponse::ok(db.role(), updates)
        }
        Err(e) => GetUpdatesResponse::error(db.role(), e.to_string()),
    }
}
