//! Configuration
//!
//! Plain structs with `Default` impls carrying the documented defaults, plus
//! a builder for the connection settings that need validation.

use crate::http::h2::{Error, Result, Settings};
use std::time::Duration;

/// How the client enters HTTP/2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// HTTP/1.1 request with `Upgrade: h2c`, then the preface
    #[default]
    Upgrade,
    /// Send the preface straight away (RFC 7540 Section 3.4)
    PriorKnowledge,
}

/// Client connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Request target of the upgrade request
    pub path: String,
    pub mode: ConnectMode,
    /// SETTINGS sent in the preface (and in `HTTP2-Settings`)
    pub settings: Settings,
    /// Size of each pooled read buffer
    pub read_buffer_size: usize,
    pub connect_timeout: Duration,
    /// Bound on each direct (pre-established) transport write
    pub write_timeout: Duration,
    /// Bound on reading the upgrade response
    pub handshake_timeout: Duration,
    /// How long a SETTINGS ACK may wait for our own preface to go out
    pub preface_wait: Duration,
    /// Successive waits for the peer to close after GOAWAY
    pub close_checks: Vec<Duration>,
    /// Minimum number of slots the pending-write queue grows by
    pub write_queue_min_growth: usize,
    /// Replenish receive windows automatically when they fall below half
    pub auto_window_update: bool,
    pub tcp_nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: crate::http::DEFAULT_HTTP_PORT,
            path: "/".to_string(),
            mode: ConnectMode::Upgrade,
            settings: Settings::client_defaults(),
            read_buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            preface_wait: Duration::from_secs(5),
            close_checks: vec![Duration::from_secs(1), Duration::from_secs(2)],
            write_queue_min_growth: crate::http::h2::write_queue::DEFAULT_MIN_GROWTH,
            auto_window_update: true,
            tcp_nodelay: true,
        }
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Default)]
pub struct ConnectionBuilder {
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        ConnectionBuilder::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn mode(mut self, mode: ConnectMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn preface_wait(mut self, wait: Duration) -> Self {
        self.config.preface_wait = wait;
        self
    }

    pub fn close_checks(mut self, checks: Vec<Duration>) -> Self {
        self.config.close_checks = checks;
        self
    }

    pub fn write_queue_min_growth(mut self, slots: usize) -> Self {
        self.config.write_queue_min_growth = slots;
        self
    }

    pub fn auto_window_update(mut self, enabled: bool) -> Self {
        self.config.auto_window_update = enabled;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.settings.validate()?;
        if self.config.read_buffer_size == 0 {
            return Err(Error::Internal("read buffer size must be non-zero".into()));
        }
        if self.config.write_queue_min_growth == 0 {
            return Err(Error::Internal("write queue growth must be non-zero".into()));
        }
        Ok(self.config)
    }
}

/// Server shutdown quiesce configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuiesceConfig {
    /// Longest time to wait for channels to drain; zero closes everything at once
    pub timeout: Duration,
    /// Period of the drain verifier
    pub verify_interval: Duration,
}

impl Default for QuiesceConfig {
    fn default() -> Self {
        QuiesceConfig {
            timeout: Duration::ZERO,
            verify_interval: Duration::from_secs(1),
        }
    }
}

/// Listening endpoint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Bind attempts before giving up
    pub bind_attempts: u32,
    pub bind_retry_interval: Duration,
    pub backlog: i32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            bind_attempts: 60,
            bind_retry_interval: Duration::from_millis(5000),
            backlog: 511,
        }
    }
}
