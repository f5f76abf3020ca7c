//! HTTP layer
//!
//! HTTP/1.1 is only spoken long enough to upgrade the connection to
//! cleartext HTTP/2 (`h2c`, RFC 7540 Section 3.2): [`upgrade`] builds the
//! upgrade request and validates the `101 Switching Protocols` response.
//! Everything after that lives in [`h2`].
//!
//! # Examples
//!
//! ```
//! use h2link::http::upgrade::{UpgradeRequest, UpgradeResponseParser};
//! use h2link::http::h2::Settings;
//! use bytes::BytesMut;
//!
//! let request = UpgradeRequest::new("localhost", 8080, "/", Settings::client_defaults());
//! assert!(request.encode().starts_with(b"GET / HTTP/1.1\r\n"));
//!
//! let mut parser = UpgradeResponseParser::new();
//! let mut buf = BytesMut::from(
//!     &b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n"[..],
//! );
//! let response = parser.feed(&mut buf).unwrap().unwrap();
//! assert_eq!(response.status, 101);
//! ```

pub mod h2;
pub mod headers;
pub mod upgrade;

pub use headers::Headers;
pub use upgrade::{UpgradeRequest, UpgradeResponse, UpgradeResponseParser};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP/1.1 and handshake errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// The upgrade response was complete but did not switch to h2c
    #[error("Upgrade handshake failed: {0}")]
    Handshake(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
