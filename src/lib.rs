//! TLS-secured network transport for cluster membership gossip.
//!
//! The gossip engine above this crate only needs two message shapes —
//! unordered datagram-like packets and ordered full-duplex streams — over
//! an arbitrary set of peers, without knowing anything about sockets,
//! pooling, or framing. This crate is that data plane: one encrypted TCP
//! listener per node, multiplexing both shapes over a self-describing wire
//! envelope.
//!
//! # Architecture
//!
//! ```text
//! TlsTransport
//!   ├── accept loop (one task per transport)
//!   │     └── demultiplex: packet channel | stream channel
//!   ├── ConnectionPool (outbound packets, keyed by addr + timeout)
//!   │     └── TlsConn (write lock + liveness flag)
//!   ├── dial_timeout (outbound streams, unpooled)
//!   └── Envelope codec (length-prefixed, version + kind tagged)
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use gossip_transport::{TlsContext, TlsTransport, TransportConfig};
//!
//! let tls = TlsContext::new(server_config, client_config);
//! let transport = TlsTransport::new(TransportConfig::new("0.0.0.0", 9094), Some(tls)).await?;
//!
//! transport.write_to(b"ping", "10.0.0.5:9094").await?;
//! if let Some(packet) = transport.recv_packet().await {
//!     println!("{} bytes from {}", packet.buf.len(), packet.from);
//! }
//! transport.shutdown().await?;
//! ```
//!
//! Reliability above the stream layer — retries, backoff, acknowledgement —
//! is the gossip engine's job, not this crate's.

pub mod config;
pub mod conn;
pub mod envelope;
pub mod error;
pub mod pool;
pub mod stream;
pub mod tls;
pub mod transport;

// Re-exports
pub use config::TransportConfig;
pub use conn::TlsConn;
pub use envelope::{Envelope, MessageKind, Packet, PROTOCOL_VERSION};
pub use error::{TransportError, TransportResult};
pub use pool::ConnectionPool;
pub use stream::{box_stream, AsyncStream, DynStream};
pub use tls::TlsContext;
pub use transport::{TlsTransport, Transport};
