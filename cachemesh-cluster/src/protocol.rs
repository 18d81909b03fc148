// Cluster wire protocol
// Tagged frames over TCP: length-prefixed tag string, bincode body, ACK reply

use cachemesh_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ACK: &str = "ACK";

const MAX_TAG_BYTES: usize = 64;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Messages exchanged between peer nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterMessage {
    Heartbeat {
        node_id: String,
        timestamp: u64,
    },
    Invalidation {
        cache_name: String,
        /// None invalidates the whole cache
        key: Option<String>,
        origin_node_id: String,
        version: u64,
        timestamp: u64,
    },
    Replication {
        cache_name: String,
        key: String,
        value: Vec<u8>,
        ttl_ms: u64,
        origin_node_id: String,
        version: u64,
        timestamp: u64,
    },
}

impl ClusterMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ClusterMessage::Heartbeat { .. } => "HEARTBEAT",
            ClusterMessage::Invalidation { .. } => "INVALIDATION",
            ClusterMessage::Replication { .. } => "REPLICATION",
        }
    }

    /// Node that produced this message
    pub fn origin(&self) -> &str {
        match self {
            ClusterMessage::Heartbeat { node_id, .. } => node_id,
            ClusterMessage::Invalidation { origin_node_id, .. } => origin_node_id,
            ClusterMessage::Replication { origin_node_id, .. } => origin_node_id,
        }
    }
}

pub fn encode(message: &ClusterMessage) -> Result<Vec<u8>> {
    bincode::serialize(message)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {}", e)))
}

pub fn decode(bytes: &[u8]) -> Result<ClusterMessage> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Serialization(format!("failed to decode message: {}", e)))
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, cap: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > cap {
        // The claimed body is not consumed, so the next frame boundary is lost
        return Err(Error::FrameDesync(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, cap
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

/// Write one tagged message frame
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ClusterMessage,
) -> Result<()> {
    let body = encode(message)?;
    write_chunk(writer, message.tag().as_bytes()).await?;
    write_chunk(writer, &body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one tagged message frame. Both chunks are consumed before any
/// validation, so a `Serialization` error leaves the stream at the next
/// frame boundary; only `FrameDesync` means the boundary is lost.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ClusterMessage> {
    let tag_bytes = read_chunk(reader, MAX_TAG_BYTES).await?;
    let body = read_chunk(reader, MAX_BODY_BYTES).await?;

    let tag = String::from_utf8(tag_bytes)
        .map_err(|_| Error::Serialization("frame tag is not valid UTF-8".to_string()))?;
    let message = decode(&body)?;
    if message.tag() != tag {
        return Err(Error::Serialization(format!(
            "frame tag '{}' does not match body variant '{}'",
            tag,
            message.tag()
        )));
    }
    Ok(message)
}

pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    write_chunk(writer, ACK.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let bytes = read_chunk(reader, MAX_TAG_BYTES).await?;
    if bytes != ACK.as_bytes() {
        return Err(Error::Serialization(format!(
            "expected ACK, got {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}
