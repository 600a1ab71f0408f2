// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication wire protocol: binary-framed messages over TCP.
//!
//! Every message is `[u32 msg_type BE][u32 payload_len BE][payload]`, with
//! bincode-encoded payloads. The protocol is a strict request/response
//! exchange on a persistent connection: a puller writes `GET_UPDATES`
//! frames and reads `UPDATES` frames, one at a time, for as long as the
//! connection lives.
//!
//! Payload sizes are capped on the read side so a malformed or hostile
//! frame header cannot trigger an unbounded allocation.

use crate::batch::UpdateBatch;
use crate::shard::ReplicaRole;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Request for contiguous updates after a sequence cursor.
pub const MSG_GET_UPDATES: u32 = 0x01;
/// Response carrying an [`UpdateBatch`] (possibly empty) or an error code.
pub const MSG_UPDATES: u32 = 0x02;

/// Maximum single message payload (64 MB safety limit).
const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// `GetUpdates(shard, from_seq, wait_ms)` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesRequest {
    pub shard: String,
    /// The caller has durably applied everything up to and including this
    /// sequence; on a leader in sync-one-ack mode a Follower's `from_seq`
    /// doubles as its acknowledgement.
    pub from_seq: u64,
    /// How long the responder may hold the request open waiting for new
    /// sequences. Clamped server-side to the configured ceiling.
    pub max_wait_ms: u32,
    pub caller_role: ReplicaRole,
}

/// Outcome of a `GetUpdates` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    ShardNotFound,
    Error,
}

/// `GetUpdates` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUpdatesResponse {
    pub code: ResponseCode,
    /// Role of the shard that answered. `None` when the shard was not found.
    /// Pullers use this to tell an idle Leader (healthy) from a non-Leader
    /// upstream that will never have data (degenerate wiring).
    pub responder_role: Option<ReplicaRole>,
    pub updates: UpdateBatch,
    pub error_msg: Option<String>,
}

impl GetUpdatesResponse {
    pub fn ok(responder_role: ReplicaRole, updates: UpdateBatch) -> Self {
        Self {
            code: ResponseCode::Ok,
            responder_role: Some(responder_role),
            updates,
            error_msg: None,
        }
    }

    pub fn shard_not_found(shard: &str) -> Self {
        Self {
            code: ResponseCode::ShardNotFound,
            responder_role: None,
            updates: UpdateBatch::default(),
            error_msg: Some(format!("shard not found: {shard}")),
        }
    }

    pub fn error(responder_role: ReplicaRole, message: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Error,
            responder_role: Some(responder_role),
            updates: UpdateBatch::default(),
            error_msg: Some(message.into()),
        }
    }
}

/// Write a framed message: `[msg_type u32 BE][payload_len u32 BE][payload]`.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: u32,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload too large: {} bytes", payload.len()),
        ));
    }
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&msg_type.to_be_bytes());
    header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a framed message, returning `(msg_type, payload)`.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;
    let msg_type = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload too large: {payload_len} bytes"),
        ));
    }
    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((msg_type, payload))
}

/// Serialize a message body.
pub fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| io::Error::other(e.to_string()))
}

/// Deserialize a message body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    bincode::deserialize(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
