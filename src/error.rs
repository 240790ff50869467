//! Error types for the gossip transport.

use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The configured bind address did not parse as an IP address.
    #[error("invalid bind address {0:?}")]
    InvalidBindAddr(String),

    /// A TLS context is required but was not supplied.
    #[error("no TLS context supplied; the transport cannot run unencrypted")]
    TlsRequired,

    /// The explicitly configured advertise address did not parse.
    #[error("failed to parse advertise address {0:?}")]
    InvalidAdvertiseAddr(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The connection was closed or retired and may no longer be used.
    #[error("connection closed")]
    ConnectionClosed,

    /// Envelope serialization or deserialization failed.
    #[error("envelope codec error: {0}")]
    Serialization(#[from] bitcode::Error),

    /// A frame declared a length above the configured maximum.
    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge { size: usize, max_size: usize },

    /// A frame was structurally invalid.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A packet's origin address could not be resolved.
    #[error("error parsing packet sender address {0:?}")]
    OriginAddr(String),

    /// TLS-level failure outside the I/O path.
    #[error("tls error: {0}")]
    Tls(String),
}
