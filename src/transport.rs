//! TLS transport: listener, accept loop, outbound operations, shutdown.
//!
//! One transport owns one TLS listener. The accept loop demultiplexes every
//! inbound connection by its envelopes: packet envelopes land on the packet
//! channel, and the connection keeps serving packets until the peer closes
//! it; a stream signal hands the rest of the connection to the stream
//! channel as a raw duplex byte stream. Outbound packets go through the
//! connection pool; outbound streams are fresh, unpooled dials.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::TransportConfig;
use crate::conn::{configure_socket, TlsConn};
use crate::envelope::{read_envelope, Packet};
use crate::error::{TransportError, TransportResult};
use crate::pool::ConnectionPool;
use crate::stream::{box_stream, DynStream};
use crate::tls::TlsContext;

/// The transport surface the gossip engine consumes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one packet to `addr`. At most one delivery per attempt; there is
    /// no retry below the engine.
    async fn write_to(&self, payload: &[u8], addr: &str) -> TransportResult<usize>;

    /// Open a fresh, unpooled full-duplex stream to `addr`.
    async fn dial_timeout(&self, addr: &str, dial_timeout: Duration)
        -> TransportResult<DynStream>;

    /// Next inbound packet, or `None` once the transport has shut down.
    async fn recv_packet(&self) -> Option<Packet>;

    /// Next inbound stream, or `None` once the transport has shut down.
    async fn recv_stream(&self) -> Option<DynStream>;

    /// The address other nodes should use to reach this node.
    fn final_advertise_addr(
        &self,
        advertise_ip: Option<&str>,
        advertise_port: Option<u16>,
    ) -> TransportResult<(IpAddr, u16)>;

    /// The actually bound listener port.
    fn auto_bind_port(&self) -> u16;

    /// Stop accepting and release the listener. Idempotent.
    async fn shutdown(&self) -> TransportResult<()>;
}

/// TLS-secured packet/stream transport for the gossip engine.
pub struct TlsTransport {
    config: TransportConfig,

    /// Parsed bind IP, used for advertise-address resolution.
    bind_ip: IpAddr,

    /// Actual listener address (resolves OS-assigned ports).
    local_addr: SocketAddr,

    tls: TlsContext,

    /// Outbound packet connections.
    pool: ConnectionPool,

    packet_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    stream_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DynStream>>,

    /// Background task handles, joined on shutdown.
    tasks: RwLock<Vec<JoinHandle<()>>>,

    shutdown_tx: broadcast::Sender<()>,

    /// Cleared first during shutdown so listener errors caused by our own
    /// close are never reported as failures.
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("bind_ip", &self.bind_ip)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// Bind the listener and start the accept loop.
    ///
    /// The listener is live before this returns: a peer may connect
    /// immediately. Exactly one accept task is spawned.
    ///
    /// # Errors
    ///
    /// Returns `TlsRequired` when no TLS context is supplied,
    /// `InvalidBindAddr` when the bind address does not parse, and any bind
    /// failure. All are configuration errors: immediate, never retried.
    pub async fn new(config: TransportConfig, tls: Option<TlsContext>) -> TransportResult<Self> {
        let Some(tls) = tls else {
            return Err(TransportError::TlsRequired);
        };

        let bind_ip: IpAddr = config
            .bind_addr
            .parse()
            .map_err(|_| TransportError::InvalidBindAddr(config.bind_addr.clone()))?;

        let listener = TcpListener::bind(SocketAddr::new(bind_ip, config.bind_port)).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!("gossip transport listening on {}", local_addr);

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let running = Arc::new(AtomicBool::new(true));

        let transport = Self {
            pool: ConnectionPool::new(tls.clone(), &config),
            config,
            bind_ip,
            local_addr,
            tls,
            packet_rx: tokio::sync::Mutex::new(packet_rx),
            stream_rx: tokio::sync::Mutex::new(stream_rx),
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
            running,
        };

        let accept_handle = transport.spawn_accept_loop(listener, packet_tx, stream_tx);
        transport.tasks.write().push(accept_handle);

        Ok(transport)
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        packet_tx: mpsc::UnboundedSender<Packet>,
        stream_tx: mpsc::UnboundedSender<DynStream>,
    ) -> JoinHandle<()> {
        let tls = self.tls.clone();
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let tls = tls.clone();
                                let config = config.clone();
                                let packet_tx = packet_tx.clone();
                                let stream_tx = stream_tx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_inbound(
                                        stream, peer, tls, config, packet_tx, stream_tx,
                                    )
                                    .await
                                    {
                                        tracing::warn!(
                                            "failed to handle inbound connection from {}: {}",
                                            peer,
                                            e
                                        );
                                    }
                                });
                            }
                            Err(e) => {
                                // A closed listener during shutdown is a
                                // clean exit, not a failure.
                                if !running.load(Ordering::SeqCst) {
                                    break;
                                }
                                tracing::error!("accept error: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Send one packet via the pool, with this node's advertised address as
    /// origin. A failure retires the connection so the next call redials.
    pub async fn write_to(&self, payload: &[u8], addr: &str) -> TransportResult<usize> {
        let conn = self.pool.borrow(addr, self.config.dial_timeout()).await?;
        let from_addr = SocketAddr::new(self.bind_ip, self.auto_bind_port()).to_string();
        conn.write_packet(&from_addr, payload, self.config.max_frame_len)
            .await?;
        Ok(payload.len())
    }

    /// Open a new, unpooled connection, announce it as a stream, and return
    /// it for the caller to read and write directly.
    pub async fn dial_timeout(
        &self,
        addr: &str,
        dial_timeout: Duration,
    ) -> TransportResult<DynStream> {
        let conn = TlsConn::dial(
            addr,
            dial_timeout,
            &self.tls,
            self.config.keepalive_interval(),
        )
        .await?;
        conn.write_stream_signal(self.config.max_frame_len).await?;
        conn.into_stream().ok_or(TransportError::ConnectionClosed)
    }

    /// Next inbound packet, or `None` once the transport has shut down.
    pub async fn recv_packet(&self) -> Option<Packet> {
        self.packet_rx.lock().await.recv().await
    }

    /// Next inbound stream, or `None` once the transport has shut down.
    pub async fn recv_stream(&self) -> Option<DynStream> {
        self.stream_rx.lock().await.recv().await
    }

    /// Resolve the address other nodes should use to reach this node.
    ///
    /// An explicit IP wins but must parse. A non-wildcard bind address is
    /// used as-is. A wildcard bind falls back to interface discovery. An
    /// explicit port wins; otherwise the actually bound port is used, which
    /// matters when the configured port was zero.
    pub fn final_advertise_addr(
        &self,
        advertise_ip: Option<&str>,
        advertise_port: Option<u16>,
    ) -> TransportResult<(IpAddr, u16)> {
        let ip = match advertise_ip {
            Some(explicit) => explicit
                .parse()
                .map_err(|_| TransportError::InvalidAdvertiseAddr(explicit.to_string()))?,
            None if self.bind_ip.is_unspecified() => discover_advertise_ip()?,
            None => self.bind_ip,
        };

        let port = advertise_port
            .filter(|p| *p != 0)
            .unwrap_or_else(|| self.auto_bind_port());

        Ok((ip, port))
    }

    /// The actually bound listener port.
    pub fn auto_bind_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The actually bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the listener without leaking the accept
    /// task. Safe to call more than once; later calls are no-ops.
    pub async fn shutdown(&self) -> TransportResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("shutting down gossip transport on {}", self.local_addr);

        let _ = self.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.write().drain(..).collect();
        for task in tasks {
            let _ = timeout(Duration::from_secs(5), task).await;
        }

        Ok(())
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

/// Serve one accepted connection: TLS handshake, then demultiplex its
/// envelopes. A pooled sender delivers many packets over one connection, so
/// packet envelopes are read in a loop until the peer closes; a stream
/// signal ends framing and hands the connection off. Errors here close this
/// connection only; the accept loop never stops for them.
async fn handle_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    tls: TlsContext,
    config: TransportConfig,
    packet_tx: mpsc::UnboundedSender<Packet>,
    stream_tx: mpsc::UnboundedSender<DynStream>,
) -> TransportResult<()> {
    configure_socket(&stream, config.keepalive_interval())?;

    let handshake_timeout = config.handshake_timeout();
    let tls_stream = timeout(handshake_timeout, tls.acceptor().accept(stream))
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "tls accept",
            timeout_ms: config.handshake_timeout_ms,
        })??;

    let mut stream: DynStream = box_stream(tls_stream);

    // The first envelope announces what this connection is; a peer that
    // stalls here is dropped. Later packet reads may block indefinitely:
    // pooled connections sit idle between sends.
    let first = timeout(
        handshake_timeout,
        read_envelope(&mut stream, config.max_frame_len),
    )
    .await
    .map_err(|_| TransportError::Timeout {
        operation: "envelope read",
        timeout_ms: config.handshake_timeout_ms,
    })??;

    let Some(mut envelope) = first else {
        return Ok(());
    };

    loop {
        match envelope.into_packet()? {
            Some(packet) => {
                tracing::debug!("packet from {} via {}", packet.from, peer);
                if packet_tx.send(packet).is_err() {
                    // Transport shut down; stop reading.
                    return Ok(());
                }
            },
            // The signal has been consumed; the rest is the caller's stream.
            None => {
                tracing::debug!("stream connection from {}", peer);
                let _ = stream_tx.send(stream);
                return Ok(());
            },
        }

        envelope = match read_envelope(&mut stream, config.max_frame_len).await? {
            Some(envelope) => envelope,
            None => return Ok(()),
        };
    }
}

/// Discover an outbound-facing IP for wildcard binds. A connected UDP
/// socket learns the egress interface address without sending any packets;
/// hosts with no route fall back to loopback.
fn discover_advertise_ip() -> TransportResult<IpAddr> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    match probe.connect(("8.8.8.8", 53)).and_then(|()| probe.local_addr()) {
        Ok(addr) if !addr.ip().is_unspecified() => Ok(addr.ip()),
        _ => Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn write_to(&self, payload: &[u8], addr: &str) -> TransportResult<usize> {
        TlsTransport::write_to(self, payload, addr).await
    }

    async fn dial_timeout(
        &self,
        addr: &str,
        dial_timeout: Duration,
    ) -> TransportResult<DynStream> {
        TlsTransport::dial_timeout(self, addr, dial_timeout).await
    }

    async fn recv_packet(&self) -> Option<Packet> {
        TlsTransport::recv_packet(self).await
    }

    async fn recv_stream(&self) -> Option<DynStream> {
        TlsTransport::recv_stream(self).await
    }

    fn final_advertise_addr(
        &self,
        advertise_ip: Option<&str>,
        advertise_port: Option<u16>,
    ) -> TransportResult<(IpAddr, u16)> {
        TlsTransport::final_advertise_addr(self, advertise_ip, advertise_port)
    }

    fn auto_bind_port(&self) -> u16 {
        TlsTransport::auto_bind_port(self)
    }

    async fn shutdown(&self) -> TransportResult<()> {
        TlsTransport::shutdown(self).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tls::testing::self_signed_context;

    async fn start_transport() -> TlsTransport {
        TlsTransport::new(
            TransportConfig::new("127.0.0.1", 0),
            Some(self_signed_context()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_tls_context() {
        let result = TlsTransport::new(TransportConfig::new("127.0.0.1", 0), None).await;
        assert!(matches!(result, Err(TransportError::TlsRequired)));
    }

    #[tokio::test]
    async fn rejects_invalid_bind_address() {
        for bad in ["", "abc123", "300.1.1.1"] {
            let result = TlsTransport::new(
                TransportConfig::new(bad, 0),
                Some(self_signed_context()),
            )
            .await;
            match result {
                Err(TransportError::InvalidBindAddr(addr)) => assert_eq!(addr, bad),
                other => panic!("expected InvalidBindAddr, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn listener_is_bound_before_new_returns() {
        let transport = start_transport().await;

        assert!(transport.auto_bind_port() > 0);
        // The listener is already live: a raw connect succeeds immediately.
        let connected = TcpStream::connect(transport.local_addr()).await;
        assert!(connected.is_ok());

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertise_addr_explicit_ip_and_port() {
        let transport = start_transport().await;

        let (ip, port) = transport
            .final_advertise_addr(Some("10.0.0.5"), Some(54231))
            .unwrap();
        assert_eq!(ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(port, 54231);

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertise_addr_rejects_unparseable_ip() {
        let transport = start_transport().await;

        let result = transport.final_advertise_addr(Some("invalid"), Some(54231));
        match result {
            Err(TransportError::InvalidAdvertiseAddr(ip)) => assert_eq!(ip, "invalid"),
            other => panic!("expected InvalidAdvertiseAddr, got {other:?}"),
        }

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertise_addr_uses_bind_ip_when_not_wildcard() {
        let transport = start_transport().await;

        let (ip, port) = transport.final_advertise_addr(None, None).unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(port, transport.auto_bind_port());
        assert!(port > 0);

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertise_addr_discovers_ip_for_wildcard_bind() {
        let transport = TlsTransport::new(
            TransportConfig::new("0.0.0.0", 0),
            Some(self_signed_context()),
        )
        .await
        .unwrap();

        let (ip, port) = transport.final_advertise_addr(None, None).unwrap();
        assert!(!ip.is_unspecified());
        assert!(port > 0);

        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn write_to_delivers_packet_with_origin() {
        let t1 = start_transport().await;
        let t2 = start_transport().await;

        let to = t2.local_addr().to_string();
        let sent = b"test packet";

        let n = t1.write_to(sent, &to).await.unwrap();
        assert_eq!(n, sent.len());

        let packet = timeout(Duration::from_secs(5), t2.recv_packet())
            .await
            .expect("timed out waiting for packet")
            .expect("packet channel closed");

        assert_eq!(packet.buf, sent);
        let expected_from = format!("127.0.0.1:{}", t1.auto_bind_port());
        assert_eq!(packet.from.to_string(), expected_from);

        t1.shutdown().await.unwrap();
        t2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_packet_is_valid() {
        let t1 = start_transport().await;
        let t2 = start_transport().await;

        t1.write_to(b"", &t2.local_addr().to_string())
            .await
            .unwrap();

        let packet = timeout(Duration::from_secs(5), t2.recv_packet())
            .await
            .unwrap()
            .unwrap();
        assert!(packet.buf.is_empty());

        t1.shutdown().await.unwrap();
        t2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sequential_write_to_reuses_pooled_connection() {
        let t1 = start_transport().await;
        let t2 = start_transport().await;
        let to = t2.local_addr().to_string();

        t1.write_to(b"one", &to).await.unwrap();
        t1.write_to(b"two", &to).await.unwrap();
        assert_eq!(t1.pool.size(), 1);

        for expected in [&b"one"[..], b"two"] {
            let packet = timeout(Duration::from_secs(5), t2.recv_packet())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet.buf, expected);
        }

        t1.shutdown().await.unwrap();
        t2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dial_timeout_opens_full_duplex_stream() {
        let t1 = start_transport().await;
        let t2 = start_transport().await;

        let mut from = t1
            .dial_timeout(&t2.local_addr().to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let mut to = timeout(Duration::from_secs(5), t2.recv_stream())
            .await
            .expect("timed out waiting for stream")
            .expect("stream channel closed");

        let sent = b"test stream";
        from.write_all(sent).await.unwrap();
        from.flush().await.unwrap();

        let mut buf = [0u8; 11];
        to.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, sent);

        // The stream is full-duplex: the accepting side can answer.
        to.write_all(b"reply").await.unwrap();
        to.flush().await.unwrap();

        let mut buf = [0u8; 5];
        from.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        t1.shutdown().await.unwrap();
        t2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn write_to_unreachable_peer_errors() {
        let t1 = start_transport().await;

        // Bind-then-drop guarantees nothing is listening on the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = t1.write_to(b"nobody home", &addr).await;
        assert!(result.is_err());

        t1.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dial_exceeding_timeout_is_hard_error() {
        let t1 = start_transport().await;

        // Non-routable address: the connect can only end by deadline.
        let result = t1
            .dial_timeout("10.255.255.1:9094", Duration::from_millis(100))
            .await;
        assert!(result.is_err());

        t1.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_delivery() {
        let transport = start_transport().await;
        assert!(transport.is_running());

        transport.shutdown().await.unwrap();
        assert!(!transport.is_running());

        // A second call is a no-op, not an error.
        transport.shutdown().await.unwrap();

        // Delivery channels drain to None once the accept loop is gone.
        let packet = timeout(Duration::from_secs(1), transport.recv_packet())
            .await
            .expect("recv_packet should resolve after shutdown");
        assert!(packet.is_none());
    }

    #[tokio::test]
    async fn accept_loop_survives_garbage_connections() {
        let t1 = start_transport().await;
        let t2 = start_transport().await;
        let to = t2.local_addr().to_string();

        // A peer that speaks no TLS at all is logged and dropped.
        let mut garbage = TcpStream::connect(t2.local_addr()).await.unwrap();
        garbage.write_all(b"definitely not a tls hello").await.unwrap();
        drop(garbage);

        // The transport keeps accepting real traffic afterwards.
        t1.write_to(b"still alive", &to).await.unwrap();
        let packet = timeout(Duration::from_secs(5), t2.recv_packet())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.buf, b"still alive");

        t1.shutdown().await.unwrap();
        t2.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clean_shutdown_logs_no_listener_errors() {
        use std::sync::Arc;

        #[derive(Clone)]
        struct CaptureWriter(Arc<parking_lot::Mutex<Vec<u8>>>);

        impl std::io::Write for CaptureWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
            type Writer = CaptureWriter;

            fn make_writer(&'a self) -> Self::Writer {
                self.clone()
            }
        }

        let captured = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(CaptureWriter(Arc::clone(&captured)))
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = start_transport().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let logs = String::from_utf8(captured.lock().clone()).unwrap();
        assert!(
            !logs.contains("accept error"),
            "shutdown produced spurious accept errors: {logs}"
        );
        assert!(logs.contains("shutting down gossip transport"));
    }

    #[tokio::test]
    async fn transport_object_is_usable_through_the_trait() {
        let transport: Box<dyn Transport> = Box::new(start_transport().await);

        assert!(transport.auto_bind_port() > 0);
        let (ip, _) = transport.final_advertise_addr(None, None).unwrap();
        assert!(!ip.is_unspecified());

        transport.shutdown().await.unwrap();
    }
}
