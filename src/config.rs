//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the TLS gossip transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// IP address to bind the listener to.
    pub bind_addr: String,

    /// Port to bind the listener to. Zero defers the choice to the OS.
    pub bind_port: u16,

    /// Default dial timeout in milliseconds, used by `write_to` when
    /// borrowing pooled connections. Also the pooled connection's write
    /// timeout, so it participates in pool-entry identity.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,

    /// Timeout in milliseconds for the TLS handshake and envelope read on
    /// each accepted connection.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Maximum decoded envelope size in bytes.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Enable TCP keepalive on every connection.
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,

    /// Keepalive probe interval in seconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

fn default_dial_timeout() -> u64 {
    10_000
}
fn default_handshake_timeout() -> u64 {
    5_000
}
fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}
fn default_keepalive() -> bool {
    true
}
fn default_keepalive_interval() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 9094,
            dial_timeout_ms: default_dial_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            max_frame_len: default_max_frame_len(),
            keepalive: default_keepalive(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl TransportConfig {
    pub fn new(bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    #[must_use]
    pub fn with_keepalive_interval_secs(mut self, secs: u64) -> Self {
        self.keepalive_interval_secs = secs;
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Keepalive interval, or `None` when keepalive is disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}
