//! Client pool for pull RPCs.
//!
//! Connections are **lazy** and **reused**: a pull loop checks a client out
//! of the pool, runs one `GetUpdates` exchange on it, and checks it back in
//! on success. A transport error marks the client stale: it is simply
//! dropped, and the next checkout dials a fresh connection. Idle
//! connections are capped per peer at `num_io_threads`.

use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::wire::{self, GetUpdatesRequest, GetUpdatesResponse, MSG_GET_UPDATES, MSG_UPDATES};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// How long a dial may take before the peer is declared unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One persistent connection to a peer's update server. At most one RPC is
/// in flight per client.
#[derive(Debug)]
pub struct ReplicatorClient {
    peer: SocketAddr,
    stream: BufStream<TcpStream>,
}

impl ReplicatorClient {
    /// Dial a peer.
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| ReplicatorError::transport(peer, "connect timed out"))?
            .map_err(|e| ReplicatorError::transport(peer, e.to_string()))?;
        let _ = stream.set_nodelay(true);
        debug!(peer = %peer, "connected to peer");
        Ok(Self {
            peer,
            stream: BufStream::new(stream),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run one `GetUpdates` exchange with a client-side deadline. The
    /// deadline must exceed the requested server wait so the server times
    /// out first and answers with an empty batch.
    pub async fn get_updates(
        &mut self,
        request: &GetUpdatesRequest,
        deadline: Duration,
    ) -> Result<GetUpdatesResponse> {
        let body =
            wire::encode(request).map_err(|e| ReplicatorError::transport(self.peer, e.to_string()))?;

        let exchange = async {
            wire::write_message(&mut self.stream, MSG_GET_UPDATES, &body).await?;
            wire::read_message(&mut self.stream).await
        };

        let (msg_type, payload) = timeout(deadline, exchange)
            .await
            .map_err(|_| ReplicatorError::transport(self.peer, "rpc deadline exceeded"))?
            .map_err(|e: std::io::Error| ReplicatorError::transport(self.peer, e.to_string()))?;

        if msg_type != MSG_UPDATES {
            return Err(ReplicatorError::transport(
                self.peer,
                format!("unexpected message type {msg_type:#x}"),
            ));
        }
        wire::decode(&payload).map_err(|e| ReplicatorError::transport(self.peer, e.to_string()))
    }
}

/// Keyed pool of reusable clients, one stack of idle connections per peer.
pub struct ClientPool {
    idle: DashMap<SocketAddr, Vec<ReplicatorClient>>,
    max_idle_per_peer: usize,
}

impl ClientPool {
    pub fn new(max_idle_per_peer: usize) -> Self {
        Self {
            idle: DashMap::new(),
            max_idle_per_peer: max_idle_per_peer.max(1),
        }
    }

    /// Take an idle client for the peer, dialing a new one if none is
    /// pooled.
    pub async fn checkout(&self, peer: SocketAddr) -> Result<ReplicatorClient> {
        if let Some(mut idle) = self.idle.get_mut(&peer) {
            if let Some(client) = idle.pop() {
                return Ok(client);
            }
        }
        match ReplicatorClient::connect(peer).await {
            Ok(client) => Ok(client),
            Err(e) => {
                metrics::record_connection_error(&peer.to_string());
                Err(e)
            }
        }
    }

    /// Return a healthy client to the pool. Clients that errored must be
    /// dropped by the caller instead, so staleness never propagates.
    pub fn checkin(&self, client: ReplicatorClient) {
        let mut idle = self.idle.entry(client.peer()).or_default();
        if idle.len() < self.max_idle_per_peer {
            idle.push(client);
        }
    }

    /// Idle connections currently pooled for a peer.
    pub fn idle_count(&self, peer: SocketAddr) -> usize {
        self.idle.get(&peer).map(|idle| idle.len()).unwrap_or(0)
    }

    /// Drop every pooled connection.
    pub fn clear(&self) {
        self.idle.clear();
    }
}
