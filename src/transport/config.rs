//! Transport configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Protocol version exchanged in the connection hello
pub const PROTOCOL_VERSION: u32 = 3;

/// Default port of the discovery daemon
pub const DEFAULT_DISCOVERY_PORT: u16 = 5999;

/// Which transport implementation to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportBackend {
    /// TCP sessions with keep-alive supervision
    #[default]
    Tcp,
    /// Drops every send and never produces events
    Null,
}

/// Transport configuration options
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Backend selected at startup
    pub backend: TransportBackend,

    /// Address to accept sessions on (port 0 picks a free port)
    pub bind_addr: SocketAddr,

    /// Discovery daemon used to resolve unknown peer addresses
    pub discovery_addr: Option<SocketAddr>,

    /// Interval between keep-alive frames (zero together with a zero timeout disables supervision)
    pub keep_alive_interval: Duration,

    /// Session is considered dead if nothing was received for this long
    pub keep_alive_timeout: Duration,

    /// Time allowed for TCP connect plus hello exchange
    pub connect_timeout: Duration,

    /// Outgoing frames queued per session before sends fail
    pub send_queue_capacity: usize,

    /// Capacity of the event channel delivered to the update context
    pub event_channel_capacity: usize,

    /// Largest accepted frame in bytes
    pub max_frame_size: usize,

    /// Protocol version announced in the hello
    pub protocol_version: u32,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::Tcp,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_addr: None,
            keep_alive_interval: Duration::from_millis(1000),
            keep_alive_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(5),
            send_queue_capacity: 1024,
            event_channel_capacity: 4096,
            max_frame_size: 16 * 1024 * 1024, // 16MB
            protocol_version: PROTOCOL_VERSION,
            tcp_nodelay: true,
            read_buffer_size: 64 * 1024, // 64KB
        }
    }
}

impl TransportConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the backend
    pub fn backend(mut self, backend: TransportBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the discovery daemon address
    pub fn discovery(mut self, addr: SocketAddr) -> Self {
        self.discovery_addr = Some(addr);
        self
    }

    /// Set keep-alive interval and timeout
    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive_interval = interval;
        self.keep_alive_timeout = timeout;
        self
    }

    /// Disable keep-alive supervision (testing only)
    pub fn disable_keep_alive(mut self) -> Self {
        self.keep_alive_interval = Duration::ZERO;
        self.keep_alive_timeout = Duration::ZERO;
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set per-session send queue capacity
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    /// Set the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Whether keep-alive frames are sent and checked
    pub fn keep_alive_enabled(&self) -> bool {
        !self.keep_alive_interval.is_zero()
    }

    /// Check option combinations that cannot work
    ///
    /// Keep-alive is either fully disabled (both values zero) or the timeout
    /// is strictly greater than a non-zero interval.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < super::message::FRAME_HEADER_SIZE {
            return Err(Error::Config(format!(
                "max frame size {} is smaller than a frame header",
                self.max_frame_size
            )));
        }

        let interval = self.keep_alive_interval;
        let timeout = self.keep_alive_timeout;
        if interval.is_zero() && timeout.is_zero() {
            tracing::warn!("Keep-alive supervision disabled, for testing only");
            return Ok(());
        }
        if interval.is_zero() || timeout <= interval {
            return Err(Error::Config(format!(
                "keep-alive timeout ({timeout:?}) must be greater than a non-zero interval ({interval:?})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();

        assert_eq!(config.backend, TransportBackend::Tcp);
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.discovery_addr.is_none());
        assert!(config.keep_alive_enabled());
        assert!(config.tcp_nodelay);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let config = TransportConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 7000);
    }

    #[test]
    fn test_disabled_keep_alive_is_valid() {
        let config = TransportConfig::default().disable_keep_alive();

        assert!(!config.keep_alive_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keep_alive_timeout_must_exceed_interval() {
        let config = TransportConfig::default()
            .keep_alive(Duration::from_millis(500), Duration::from_millis(500));
        assert!(config.validate().is_err());

        let config =
            TransportConfig::default().keep_alive(Duration::ZERO, Duration::from_millis(500));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_send_queue_capacity_at_least_one() {
        let config = TransportConfig::default().send_queue_capacity(0);

        assert_eq!(config.send_queue_capacity, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let daemon: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        let config = TransportConfig::default()
            .bind(bind)
            .discovery(daemon)
            .backend(TransportBackend::Null)
            .keep_alive(Duration::from_millis(100), Duration::from_millis(400))
            .connect_timeout(Duration::from_secs(1))
            .max_frame_size(4096);

        assert_eq!(config.bind_addr, bind);
        assert_eq!(config.discovery_addr, Some(daemon));
        assert_eq!(config.backend, TransportBackend::Null);
        assert_eq!(config.keep_alive_interval, Duration::from_millis(100));
        assert_eq!(config.keep_alive_timeout, Duration::from_millis(400));
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.max_frame_size, 4096);
    }
}
