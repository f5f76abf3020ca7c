//! HTTP/1.1 header fields
//!
//! Ordered header list with case-insensitive lookups, used for the h2c
//! upgrade request and the 101 response.

use super::{Error, Result, CRLF, MAX_HEADERS};
use bytes::{BufMut, BytesMut};
use std::fmt;

/// HTTP headers collection
///
/// Insertion order is kept and a name may appear more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Append a header; silently ignored past [`MAX_HEADERS`]
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers.len() >= MAX_HEADERS {
            return;
        }
        self.headers.push((name.into(), value.into()));
    }

    /// First value for `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Whether some `name` header has exactly `value`, both compared case-insensitively
    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.get_all(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split a `Name: value` line
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHeader(format!("No colon in header: {}", line)));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidHeader("Empty header name".to_string()));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }

    /// Serialize as `Name: value\r\n` lines
    pub fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in &self.headers {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(CRLF.as_bytes());
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
