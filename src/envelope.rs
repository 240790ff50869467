//! Wire codec for the gossip transport.
//!
//! Every message on the wire is a length-prefixed envelope:
//!
//! ```text
//! +------------------+---------------------------+
//! | Length (4B LE)   | Envelope (bitcode)        |
//! +------------------+---------------------------+
//! ```
//!
//! The envelope carries a protocol version, a message kind, and (for
//! packets) the sender's advertised address plus the raw payload. A
//! `Stream` envelope carries nothing: it tells the receiver to stop
//! framing and treat the rest of the connection as a raw byte stream.

use std::net::SocketAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TransportError, TransportResult};

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "v1.0.0";

const LENGTH_PREFIX_LEN: usize = 4;

/// Discriminator for the two message shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// One self-contained datagram-style message.
    Packet,
    /// Signal that the connection becomes a raw duplex byte stream.
    Stream,
}

/// Self-describing wire structure wrapping every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub kind: MessageKind,
    /// Sender's advertised address. Empty for stream signals.
    pub from_addr: String,
    /// Raw payload bytes. Empty for stream signals.
    pub payload: Vec<u8>,
}

/// A decoded inbound packet, as delivered to the gossip engine.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Payload bytes, exactly as the sender passed them to `write_to`.
    pub buf: Vec<u8>,
    /// The sender's advertised address.
    pub from: SocketAddr,
    /// When the packet was decoded on this node.
    pub timestamp: SystemTime,
}

impl Envelope {
    /// Convert a decoded envelope into a packet.
    ///
    /// Returns `Ok(None)` for a stream signal: no packet, no error, and the
    /// caller should hand the connection off as a raw stream.
    ///
    /// # Errors
    ///
    /// Returns `OriginAddr` if a packet's sender address does not resolve,
    /// even though the envelope itself decoded cleanly.
    pub fn into_packet(self) -> TransportResult<Option<Packet>> {
        match self.kind {
            MessageKind::Stream => Ok(None),
            MessageKind::Packet => {
                let from = self
                    .from_addr
                    .parse::<SocketAddr>()
                    .map_err(|_| TransportError::OriginAddr(self.from_addr.clone()))?;
                Ok(Some(Packet {
                    buf: self.payload,
                    from,
                    timestamp: SystemTime::now(),
                }))
            },
        }
    }
}

/// Convert a byte length to the 4-byte little-endian prefix.
fn length_prefix(len: usize, max: usize) -> TransportResult<[u8; 4]> {
    let n = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
        size: len,
        max_size: max,
    })?;
    Ok(n.to_le_bytes())
}

fn encode(envelope: &Envelope, max_frame_len: usize) -> TransportResult<Vec<u8>> {
    let body = bitcode::serialize(envelope)?;

    if body.len() > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max_size: max_frame_len,
        });
    }

    let header = length_prefix(body.len(), max_frame_len)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Encode a packet envelope. A zero-length payload is valid.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the encoded envelope exceeds `max_frame_len`.
pub fn encode_packet(
    from_addr: &str,
    payload: &[u8],
    max_frame_len: usize,
) -> TransportResult<Vec<u8>> {
    encode(
        &Envelope {
            version: PROTOCOL_VERSION.to_string(),
            kind: MessageKind::Packet,
            from_addr: from_addr.to_string(),
            payload: payload.to_vec(),
        },
        max_frame_len,
    )
}

/// Encode a stream signal: the entire content written before the caller
/// starts using the connection as a raw byte stream.
pub fn encode_stream_signal(max_frame_len: usize) -> TransportResult<Vec<u8>> {
    encode(
        &Envelope {
            version: PROTOCOL_VERSION.to_string(),
            kind: MessageKind::Stream,
            from_addr: String::new(),
            payload: Vec::new(),
        },
        max_frame_len,
    )
}

/// Read one envelope off the wire. Returns `None` when the peer closed the
/// connection cleanly at a frame boundary.
///
/// Reads exactly the length prefix and the declared body, nothing more, so
/// a connection handed off as a raw stream afterwards loses no bytes.
///
/// # Errors
///
/// Returns an I/O error for a frame truncated mid-body (a partial frame is
/// never returned), `FrameTooLarge` or `InvalidFrame` for a bad length
/// prefix, and a serialization error for an undecodable body.
pub async fn read_envelope<R>(
    reader: &mut R,
    max_frame_len: usize,
) -> TransportResult<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut length_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_le_bytes(length_buf) as usize;

    if length > max_frame_len {
        return Err(TransportError::FrameTooLarge {
            size: length,
            max_size: max_frame_len,
        });
    }

    if length == 0 {
        return Err(TransportError::InvalidFrame(
            "zero-length envelope".to_string(),
        ));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    let envelope: Envelope = bitcode::deserialize(&body)?;
    Ok(Some(envelope))
}
