//! h2c upgrade handshake (RFC 7540 Section 3.2)
//!
//! The client sends an HTTP/1.1 request carrying `Upgrade: h2c` and its
//! SETTINGS payload in the `HTTP2-Settings` header. The server answers
//! `101 Switching Protocols`; every byte after the blank line that ends
//! that response already belongs to HTTP/2.

use super::h2::Settings;
use super::{Error, Headers, Result, CRLF};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

/// End of the HTTP/1.1 header block
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Upper bound on the size of the 101 response head
pub const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";

/// The HTTP/1.1 request that asks the server to switch to h2c
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub settings: Settings,
    /// Additional headers appended after the upgrade headers
    pub extra_headers: Headers,
}

impl UpgradeRequest {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>, settings: Settings) -> Self {
        UpgradeRequest {
            host: host.into(),
            port,
            path: path.into(),
            settings,
            extra_headers: Headers::new(),
        }
    }

    /// Value of the `HTTP2-Settings` header: base64url of the SETTINGS payload, unpadded
    pub fn settings_header(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.settings.encode_payload())
    }

    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert("Host", format!("{}:{}", self.host, self.port));
        headers.insert("Connection", "Upgrade, HTTP2-Settings");
        headers.insert("Upgrade", "h2c");
        headers.insert("HTTP2-Settings", self.settings_header());
        for (name, value) in self.extra_headers.iter() {
            headers.insert(name, value);
        }
        headers
    }

    /// Wire bytes of the request
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(format!("GET {} HTTP/1.1{}", self.path, CRLF).as_bytes());
        self.headers().write_to(&mut buf);
        buf.put_slice(CRLF.as_bytes());
        buf.freeze()
    }
}

/// Decode an `HTTP2-Settings` header value
pub fn decode_settings_header(value: &str) -> Result<Settings> {
    let payload = URL_SAFE_NO_PAD
        .decode(value.trim())
        .map_err(|e| Error::Handshake(format!("HTTP2-Settings is not base64url: {}", e)))?;
    Settings::decode_payload(&payload)
        .map_err(|e| Error::Handshake(format!("HTTP2-Settings payload: {}", e)))
}

/// A validated `101 Switching Protocols` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Accumulates the upgrade response across reads
#[derive(Debug, Default)]
pub struct UpgradeResponseParser {
    pending: BytesMut,
    complete: bool,
}

impl UpgradeResponseParser {
    pub fn new() -> Self {
        UpgradeResponseParser::default()
    }

    /// Whether a full response head has been consumed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume bytes from `buf`.
    ///
    /// Returns `Ok(None)` until the blank line ending the response head has
    /// been seen. Once it has, bytes following the head are left in `buf`.
    /// A complete head that lacks any of the status line, `Upgrade: h2c` or
    /// `Connection: Upgrade` is an [`Error::Handshake`].
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<UpgradeResponse>> {
        if self.complete {
            return Ok(None);
        }

        // Start the search a few bytes back in case the terminator straddles reads
        let search_from = self.pending.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
        self.pending.extend_from_slice(buf);
        buf.clear();

        let Some(pos) = self.pending[search_from..]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
            .map(|p| p + search_from)
        else {
            if self.pending.len() > MAX_RESPONSE_HEAD {
                return Err(Error::Handshake(format!(
                    "no end of response head within {} bytes",
                    MAX_RESPONSE_HEAD
                )));
            }
            return Ok(None);
        };

        let head = self.pending.split_to(pos + HEADER_TERMINATOR.len());
        buf.extend_from_slice(&self.pending);
        self.pending.clear();
        self.complete = true;

        let response = parse_head(&head[..pos])?;
        debug!(status = response.status, leftover = buf.len(), "upgrade response received");
        Ok(Some(response))
    }
}

fn parse_head(head: &[u8]) -> Result<UpgradeResponse> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Handshake("response head is not valid UTF-8".to_string()))?;
    let mut lines = text.split(CRLF);
    let status_line = lines.next().unwrap_or_default().trim_end();

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = Headers::parse_header_line(line)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        headers.insert(name, value);
    }

    let mut missing = Vec::new();
    if !status_line.eq_ignore_ascii_case(SWITCHING_PROTOCOLS) {
        missing.push(format!("status line \"{}\"", SWITCHING_PROTOCOLS));
    }
    if !headers.has_value("Upgrade", "h2c") {
        missing.push("Upgrade: h2c".to_string());
    }
    if !headers.has_value("Connection", "Upgrade") {
        missing.push("Connection: Upgrade".to_string());
    }
    if !missing.is_empty() {
        warn!(status_line, missing = ?missing, "upgrade rejected");
        return Err(Error::Handshake(format!(
            "response \"{}\" is missing {}",
            status_line,
            missing.join(", ")
        )));
    }

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse(format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    Ok(UpgradeResponse {
        status,
        reason,
        headers,
    })
}
