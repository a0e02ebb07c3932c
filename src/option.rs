use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// A CoAP option number.
///
/// Each option instance in a message specifies the option number, the length
/// of the option value, and the value itself (RFC 7252 §3.1). Options must be
/// transmitted in ascending numeric order; [`OptionParams`] preserves the
/// caller-specified order until the driver serializes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u32);

impl OptionNumber {
    /// If-Match
    pub const IF_MATCH: Self = Self(1);
    /// Uri-Host
    pub const URI_HOST: Self = Self(3);
    /// ETag
    pub const ETAG: Self = Self(4);
    /// If-None-Match
    pub const IF_NONE_MATCH: Self = Self(5);
    /// Uri-Port
    pub const URI_PORT: Self = Self(7);
    /// Location-Path
    pub const LOCATION_PATH: Self = Self(8);
    /// Uri-Path
    pub const URI_PATH: Self = Self(11);
    /// Content-Format
    pub const CONTENT_FORMAT: Self = Self(12);
    /// Max-Age
    pub const MAX_AGE: Self = Self(14);
    /// Uri-Query
    pub const URI_QUERY: Self = Self(15);
    /// Accept
    pub const ACCEPT: Self = Self(17);
    /// Location-Query
    pub const LOCATION_QUERY: Self = Self(20);
    /// Block1 (request-body) transfer control
    pub const BLOCK1: Self = Self(23);
    /// Block2 (response-body) transfer control
    pub const BLOCK2: Self = Self(27);
    /// Size2 response-size hint
    pub const SIZE2: Self = Self(28);
    /// Proxy-Uri
    pub const PROXY_URI: Self = Self(35);
    /// Proxy-Scheme
    pub const PROXY_SCHEME: Self = Self(39);
    /// Size1 request-size hint
    pub const SIZE1: Self = Self(60);

    /// Vendor-specific: offset to resume an interrupted transfer from
    pub const START_OFFSET: Self = Self(2048);
}

impl fmt::Display for OptionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Option value formats (RFC 7252 §3.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// UTF-8 string value
    String(String),
    /// Raw byte value
    Opaque(Bytes),
    /// Unsigned integer value
    Uint(u32),
    /// Zero-length value
    Empty,
}

impl OptionValue {
    /// The string value, if this is a string option
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// The opaque bytes, if this is an opaque option
    pub fn as_opaque(&self) -> Option<&Bytes> {
        match self {
            Self::Opaque(value) => Some(value),
            _ => None,
        }
    }

    /// The integer value, if this is a uint option
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Self::Uint(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Uint(value)
    }
}

impl From<Bytes> for OptionValue {
    fn from(value: Bytes) -> Self {
        Self::Opaque(value)
    }
}

impl From<Vec<u8>> for OptionValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Opaque(value.into())
    }
}

/// A single option of a CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// The option number
    pub number: OptionNumber,
    /// The option value
    pub value: OptionValue,
}

impl CoapOption {
    /// Creates a new option
    pub fn new(number: OptionNumber, value: impl Into<OptionValue>) -> Self {
        Self {
            number,
            value: value.into(),
        }
    }
}

impl fmt::Display for CoapOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            OptionValue::String(value) => write!(f, "{}={value}", self.number),
            OptionValue::Opaque(value) => write!(f, "{}={value:?}", self.number),
            OptionValue::Uint(value) => write!(f, "{}={value}", self.number),
            OptionValue::Empty => write!(f, "{}", self.number),
        }
    }
}

/// An ordered sequence of options handed to the driver.
///
/// Preserves the caller-specified order; the driver is responsible for
/// serializing options in ascending numeric order on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionParams(Vec<CoapOption>);

impl OptionParams {
    /// An empty parameter list
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the parameter list, yielding the options in order
    pub fn into_vec(self) -> Vec<CoapOption> {
        self.0
    }
}

impl From<Vec<CoapOption>> for OptionParams {
    fn from(options: Vec<CoapOption>) -> Self {
        Self(options)
    }
}

impl Deref for OptionParams {
    type Target = [CoapOption];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> IntoIterator for &'a OptionParams {
    type Item = &'a CoapOption;
    type IntoIter = std::slice::Iter<'a, CoapOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
