//! A single TLS connection with a write lock and a liveness flag.
//!
//! The wire format requires a header and payload to land as one logical
//! unit, so the whole write happens under one lock guard: a second writer's
//! bytes can never interleave. Any write failure permanently retires the
//! connection; it is never revived, and the pool replaces it on the next
//! borrow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::envelope::{encode_packet, encode_stream_signal};
use crate::error::{TransportError, TransportResult};
use crate::stream::{box_stream, DynStream};
use crate::tls::TlsContext;

/// Saturating conversion from `Duration` milliseconds to `u64`.
fn timeout_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Apply per-socket tuning before a connection enters service.
pub(crate) fn configure_socket(
    stream: &TcpStream,
    keepalive: Option<Duration>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    if let Some(interval) = keepalive {
        let socket = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(interval);
        socket.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// One live TLS socket plus pooling state.
pub struct TlsConn {
    /// The socket, behind the write lock. `None` once closed.
    stream: tokio::sync::Mutex<Option<DynStream>>,
    /// Per-write deadline.
    write_timeout: Duration,
    /// Liveness flag. Permanently false after any write failure or close.
    live: AtomicBool,
}

impl TlsConn {
    /// Wrap an established stream (accepted or dialed).
    pub fn new(stream: DynStream, write_timeout: Duration) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(Some(stream)),
            write_timeout,
            live: AtomicBool::new(true),
        }
    }

    /// Dial `addr` and complete the TLS client handshake, both within
    /// `dial_timeout`. The same duration becomes the write timeout of the
    /// resulting connection.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if connect or handshake exceed the deadline, `Tls`
    /// for an unusable server name, or the underlying I/O error.
    pub async fn dial(
        addr: &str,
        dial_timeout: Duration,
        tls: &TlsContext,
        keepalive: Option<Duration>,
    ) -> TransportResult<Self> {
        let tcp = timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "dial",
                timeout_ms: timeout_ms(dial_timeout),
            })??;

        configure_socket(&tcp, keepalive)?;

        let server_name = server_name_for(addr)?;
        let stream = timeout(dial_timeout, tls.connector().connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "tls handshake",
                timeout_ms: timeout_ms(dial_timeout),
            })??;

        Ok(Self::new(box_stream(stream), dial_timeout))
    }

    /// Write the full byte sequence as one uninterruptible unit.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is already retired; any
    /// I/O error or timeout retires it before the error is returned.
    pub async fn write(&self, buf: &[u8]) -> TransportResult<usize> {
        if !self.is_live() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.live.store(false, Ordering::SeqCst);
            return Err(TransportError::ConnectionClosed);
        };

        let result = timeout(self.write_timeout, async {
            stream.write_all(buf).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(buf.len()),
            Ok(Err(e)) => {
                self.live.store(false, Ordering::SeqCst);
                Err(e.into())
            },
            Err(_) => {
                self.live.store(false, Ordering::SeqCst);
                Err(TransportError::Timeout {
                    operation: "write",
                    timeout_ms: timeout_ms(self.write_timeout),
                })
            },
        }
    }

    /// Encode and write one packet envelope.
    pub async fn write_packet(
        &self,
        from_addr: &str,
        payload: &[u8],
        max_frame_len: usize,
    ) -> TransportResult<usize> {
        let frame = encode_packet(from_addr, payload, max_frame_len)?;
        self.write(&frame).await
    }

    /// Write the stream signal envelope. Everything after it on this
    /// connection is raw stream data.
    pub async fn write_stream_signal(&self, max_frame_len: usize) -> TransportResult<usize> {
        let frame = encode_stream_signal(max_frame_len)?;
        self.write(&frame).await
    }

    /// Whether the connection may still be used.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Retire the connection and release the socket. Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        self.live.store(false, Ordering::SeqCst);
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            // The peer may already be gone; that is not a close failure.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    /// Take the underlying stream out of the connection, consuming it.
    pub(crate) fn into_stream(self) -> Option<DynStream> {
        self.stream.into_inner()
    }
}

/// Derive the TLS server name from a `host:port` target.
fn server_name_for(addr: &str) -> TransportResult<ServerName<'static>> {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let host = host.trim_matches(|c| c == '[' || c == ']');
    ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::Tls(format!("invalid server name {host:?}")))
}
