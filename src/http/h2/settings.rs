//! HTTP/2 settings management
//!
//! SETTINGS parameters as defined in RFC 7540 Section 6.5, with the payload
//! encoding shared by SETTINGS frames and the `HTTP2-Settings` upgrade header.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of one encoded setting (2 byte id + 4 byte value)
pub const SETTING_ENTRY_SIZE: usize = 6;

/// Largest legal SETTINGS_MAX_FRAME_SIZE value (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Largest legal window size (2^31 - 1)
pub const MAX_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    EnableConnectProtocol = 0x8,
    /// SETTINGS_NO_RFC7540_PRIORITIES (0x9) - RFC 9218
    NoRfc7540Priorities = 0x9,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            0x9 => Some(SettingsParameter::NoRfc7540Priorities),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
            SettingsParameter::NoRfc7540Priorities => "NO_RFC7540_PRIORITIES",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
///
/// Every field is optional; `None` means "not sent" and the RFC default
/// applies when read through the `get_*` accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
    pub no_rfc7540_priorities: Option<bool>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Settings a client announces when the caller configured nothing
    pub fn client_defaults() -> Self {
        Settings {
            enable_push: Some(false),
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            ..Settings::default()
        }
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// Get max concurrent streams (None = unlimited)
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Get max header list size (None = unlimited)
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Number of parameters that would be encoded
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&max_frame_size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            header_table_size,
            enable_push,
            max_concurrent_streams,
            initial_window_size,
            max_frame_size,
            max_header_list_size,
            enable_connect_protocol,
            no_rfc7540_priorities
        );
    }

    fn entries(&self) -> Vec<(SettingsParameter, u32)> {
        let flag = |b: bool| if b { 1 } else { 0 };
        let mut out = Vec::with_capacity(8);
        if let Some(v) = self.header_table_size {
            out.push((SettingsParameter::HeaderTableSize, v));
        }
        if let Some(v) = self.enable_push {
            out.push((SettingsParameter::EnablePush, flag(v)));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((SettingsParameter::MaxConcurrentStreams, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((SettingsParameter::InitialWindowSize, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((SettingsParameter::MaxFrameSize, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((SettingsParameter::MaxHeaderListSize, v));
        }
        if let Some(v) = self.enable_connect_protocol {
            out.push((SettingsParameter::EnableConnectProtocol, flag(v)));
        }
        if let Some(v) = self.no_rfc7540_priorities {
            out.push((SettingsParameter::NoRfc7540Priorities, flag(v)));
        }
        out
    }

    /// Encode as a SETTINGS payload (sequence of 6-byte entries)
    pub fn encode_payload(&self) -> Bytes {
        let entries = self.entries();
        let mut buf = BytesMut::with_capacity(entries.len() * SETTING_ENTRY_SIZE);
        for (param, value) in entries {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        }
        buf.freeze()
    }

    /// Decode a SETTINGS payload
    ///
    /// Unknown identifiers are ignored (RFC 7540 Section 6.5.2). Boolean
    /// parameters other than 0 or 1 are a protocol error.
    pub fn decode_payload(mut payload: &[u8]) -> Result<Settings> {
        if payload.len() % SETTING_ENTRY_SIZE != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            let as_flag = |param: SettingsParameter| match value {
                0 => Ok(false),
                1 => Ok(true),
                v => Err(Error::Protocol(format!("{} must be 0 or 1, got {}", param, v))),
            };
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => settings.header_table_size = Some(value),
                Some(p @ SettingsParameter::EnablePush) => settings.enable_push = Some(as_flag(p)?),
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                Some(p @ SettingsParameter::EnableConnectProtocol) => {
                    settings.enable_connect_protocol = Some(as_flag(p)?)
                }
                Some(p @ SettingsParameter::NoRfc7540Priorities) => {
                    settings.no_rfc7540_priorities = Some(as_flag(p)?)
                }
                None => {}
            }
        }
        Ok(settings)
    }
}

/// Builder for HTTP/2 settings
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.settings.enable_connect_protocol = Some(enable);
        self
    }

    pub fn no_rfc7540_priorities(mut self, disable: bool) -> Self {
        self.settings.no_rfc7540_priorities = Some(disable);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_parameter_conversion() {
        assert_eq!(SettingsParameter::HeaderTableSize.as_u16(), 0x1);
        assert_eq!(
            SettingsParameter::from_u16(0x2),
            Some(SettingsParameter::EnablePush)
        );
        assert_eq!(SettingsParameter::from_u16(0x7), None);
    }

    #[test]
    fn test_settings_accessor_defaults() {
        let settings = Settings::new();
        assert_eq!(settings.get_header_table_size(), 4096);
        assert!(settings.get_enable_push());
        assert_eq!(settings.get_initial_window_size(), 65535);
        assert_eq!(settings.get_max_frame_size(), 16384);
        assert!(settings.is_empty());
    }

    #[test]
    fn test_settings_validation() {
        assert!(SettingsBuilder::new()
            .initial_window_size(65535)
            .max_frame_size(16384)
            .build()
            .is_ok());

        let err = SettingsBuilder::new()
            .initial_window_size(0x8000_0000)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::FlowControl(_)));

        assert!(SettingsBuilder::new().max_frame_size(1024).build().is_err());
        assert!(SettingsBuilder::new().max_frame_size(16_777_216).build().is_err());
    }

    #[test]
    fn test_settings_merge() {
        let mut settings1 = SettingsBuilder::new()
            .header_table_size(4096)
            .enable_push(true)
            .build()
            .unwrap();

        let settings2 = SettingsBuilder::new()
            .header_table_size(8192)
            .max_concurrent_streams(100)
            .build()
            .unwrap();

        settings1.merge(&settings2);

        assert_eq!(settings1.get_header_table_size(), 8192);
        assert!(settings1.get_enable_push());
        assert_eq!(settings1.get_max_concurrent_streams(), Some(100));
    }

    #[test]
    fn test_payload_encoding() {
        let settings = SettingsBuilder::new()
            .enable_push(false)
            .initial_window_size(1 << 20)
            .build()
            .unwrap();
        let payload = settings.encode_payload();
        assert_eq!(
            &payload[..],
            &[0, 2, 0, 0, 0, 0, 0, 4, 0, 0x10, 0, 0][..]
        );
        assert_eq!(Settings::decode_payload(&payload).unwrap(), settings);
    }

    #[test]
    fn test_decode_ignores_unknown_ids() {
        let payload = [0x00, 0x42, 0, 0, 0, 7, 0x00, 0x03, 0, 0, 0, 50];
        let settings = Settings::decode_payload(&payload).unwrap();
        assert_eq!(settings.max_concurrent_streams, Some(50));
        assert_eq!(settings.len(), 1);
    }

    #[test]
    fn test_decode_rejects_bad_length_and_flags() {
        assert!(matches!(
            Settings::decode_payload(&[0, 1, 0, 0, 0]),
            Err(Error::FrameSize(_))
        ));
        assert!(matches!(
            Settings::decode_payload(&[0, 2, 0, 0, 0, 2]),
            Err(Error::Protocol(_))
        ));
    }
}
