//! Header block compression
//!
//! The connection only needs "fields in, header block out" and the reverse,
//! so HPACK sits behind the [`HeaderCodec`] trait. [`HpackCodec`] is the
//! implementation backed by the `hpack` crate; its dynamic tables live for
//! the whole connection.

use super::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// One decoded header field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Name as text; header names are ASCII on the wire
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name_str(), self.value_str())
    }
}

impl<N: AsRef<str>, V: AsRef<str>> From<(N, V)> for HeaderField {
    fn from((name, value): (N, V)) -> Self {
        HeaderField::new(
            Bytes::copy_from_slice(name.as_ref().as_bytes()),
            Bytes::copy_from_slice(value.as_ref().as_bytes()),
        )
    }
}

/// Convert `(name, value)` string pairs into header fields
pub fn fields<N: AsRef<str>, V: AsRef<str>>(pairs: &[(N, V)]) -> Vec<HeaderField> {
    pairs
        .iter()
        .map(|(n, v)| HeaderField::from((n.as_ref(), v.as_ref())))
        .collect()
}

/// Stateful header block encoder/decoder
pub trait HeaderCodec: Send {
    fn encode_headers(&mut self, fields: &[HeaderField]) -> Result<Bytes>;

    /// Decode a complete header block; failure is a connection-level
    /// compression error since the decoder state is then unusable
    fn decode_headers(&mut self, block: &[u8]) -> Result<Vec<HeaderField>>;
}

/// [`HeaderCodec`] backed by the `hpack` crate
///
/// The decoder panics on some malformed blocks (oversized dynamic table
/// size updates among them). Panics are caught and reported as compression
/// errors, and every decode after a failure is refused.
pub struct HpackCodec {
    encoder: ::hpack::Encoder<'static>,
    decoder: ::hpack::Decoder<'static>,
    decoder_failed: bool,
}

impl HpackCodec {
    pub fn new() -> Self {
        HpackCodec {
            encoder: ::hpack::Encoder::new(),
            decoder: ::hpack::Decoder::new(),
            decoder_failed: false,
        }
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HpackCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpackCodec").finish_non_exhaustive()
    }
}

impl HeaderCodec for HpackCodec {
    fn encode_headers(&mut self, fields: &[HeaderField]) -> Result<Bytes> {
        let mut block = Vec::new();
        let tuples: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|field| (&field.name[..], &field.value[..]))
            .collect();
        self.encoder
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Compression(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }

    fn decode_headers(&mut self, block: &[u8]) -> Result<Vec<HeaderField>> {
        if self.decoder_failed {
            return Err(Error::Compression(
                "HPACK decoder unusable after an earlier failure".to_string(),
            ));
        }
        let decoder = &mut self.decoder;
        let decoded = match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(block))) {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(e)) => {
                self.decoder_failed = true;
                return Err(Error::Compression(format!("HPACK decode error: {:?}", e)));
            }
            Err(_) => {
                self.decoder_failed = true;
                return Err(Error::Compression(
                    "HPACK decoder rejected a malformed header block".to_string(),
                ));
            }
        };
        Ok(decoded
            .into_iter()
            .map(|(name, value)| HeaderField::new(name, value))
            .collect())
    }
}
