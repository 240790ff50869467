//! Stream abstraction for TLS connections.
//!
//! Provides type aliases for dynamic dispatch over different stream types,
//! so the transport can hand identical objects to the gossip engine whether
//! a connection was accepted or dialed.

use tokio::io::{AsyncRead, AsyncWrite};

/// Combined async read/write trait for bidirectional streams.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Blanket implementation for any type that satisfies the bounds.
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> AsyncStream for T {}

/// Boxed bidirectional stream for dynamic dispatch.
pub type DynStream = Box<dyn AsyncStream>;

/// Helper to box a stream into a `DynStream`.
pub fn box_stream<S>(stream: S) -> DynStream
where
    S: AsyncStream + 'static,
{
    Box::new(stream)
}
