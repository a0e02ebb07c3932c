use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::code::Method;
use crate::option::{CoapOption, OptionNumber, OptionValue};

/// Reports outgoing-body progress as a fraction in `0.0..=1.0`
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// The body of an outbound request
#[derive(Clone, Default)]
pub enum OutgoingBody {
    /// No body
    #[default]
    None,
    /// An in-memory body, optionally reporting chunk-by-chunk progress
    Data {
        /// The body bytes
        data: Bytes,
        /// Invoked after each chunk is read
        progress: Option<ProgressCallback>,
    },
}

impl OutgoingBody {
    /// The body bytes, if any
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Self::None => None,
            Self::Data { data, .. } => Some(data),
        }
    }
}

impl fmt::Debug for OutgoingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Data { data, progress } => f
                .debug_struct("Data")
                .field("len", &data.len())
                .field("progress", &progress.is_some())
                .finish(),
        }
    }
}

/// Per-request overrides for the driver's retransmission behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestParameters {
    /// Time to wait for an acknowledgement before resending
    pub ack_timeout: Option<Duration>,
    /// How often an unacknowledged request is resent
    pub max_resend_count: Option<u32>,
}

/// An outbound request intent, built via [`CoapRequestBuilder`]
#[derive(Debug, Clone)]
pub struct CoapRequest {
    /// The request method
    pub method: Method,
    /// The request path, for diagnostics
    pub path: String,
    /// Options in transmission order; uri-path options always come first
    pub options: Vec<CoapOption>,
    /// Whether the request is sent confirmable
    pub confirmable: bool,
    /// Whether a non-success response should surface as an error
    pub expects_success: bool,
    /// Whether the blockwise transfer strategy may be used
    pub accepts_blockwise_transfer: bool,
    /// The outgoing body
    pub body: OutgoingBody,
    /// Retransmission overrides, if any
    pub parameters: Option<RequestParameters>,
}

impl fmt::Display for CoapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Builds [`CoapRequest`]s.
///
/// Defaults: `GET /`, confirmable, expects success, accepts blockwise
/// transfer, no options, no body.
#[derive(Debug, Clone)]
pub struct CoapRequestBuilder {
    method: Method,
    path_segments: Vec<String>,
    options: Vec<CoapOption>,
    confirmable: bool,
    expects_success: bool,
    accepts_blockwise_transfer: bool,
    body: OutgoingBody,
    parameters: Option<RequestParameters>,
}

impl Default for CoapRequestBuilder {
    fn default() -> Self {
        Self {
            method: Method::Get,
            path_segments: Vec::new(),
            options: Vec::new(),
            confirmable: true,
            expects_success: true,
            accepts_blockwise_transfer: true,
            body: OutgoingBody::None,
            parameters: None,
        }
    }
}

impl CoapRequestBuilder {
    /// Creates a builder with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request method
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request path, replacing any previous one.
    ///
    /// The resulting uri-path options are always placed ahead of every other
    /// option, regardless of the order in which `path` and `option` were
    /// called.
    pub fn path<I>(mut self, segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.path_segments = segments.into_iter().map(Into::into).collect();
        self
    }

    /// Appends an option; explicitly-added options keep their call order
    pub fn option(mut self, number: OptionNumber, value: impl Into<OptionValue>) -> Self {
        self.options.push(CoapOption::new(number, value));
        self
    }

    /// Sets whether the request is sent confirmable
    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }

    /// Sets whether a non-success response surfaces as an error
    pub fn expects_success(mut self, expects_success: bool) -> Self {
        self.expects_success = expects_success;
        self
    }

    /// Sets whether the blockwise transfer strategy may be used
    pub fn accepts_blockwise_transfer(mut self, accepts: bool) -> Self {
        self.accepts_blockwise_transfer = accepts;
        self
    }

    /// Sets the outgoing body, replacing any previous one
    pub fn body(mut self, data: impl Into<Bytes>) -> Self {
        self.body = OutgoingBody::Data {
            data: data.into(),
            progress: None,
        };
        self
    }

    /// Sets the outgoing body with a progress callback
    pub fn body_with_progress(
        mut self,
        data: impl Into<Bytes>,
        progress: ProgressCallback,
    ) -> Self {
        self.body = OutgoingBody::Data {
            data: data.into(),
            progress: Some(progress),
        };
        self
    }

    /// Sets per-request retransmission overrides
    pub fn parameters(mut self, parameters: RequestParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Builds the request
    pub fn build(self) -> CoapRequest {
        let mut path = String::from("/");
        path.push_str(&self.path_segments.join("/"));

        let mut options = Vec::with_capacity(self.path_segments.len() + self.options.len());
        options.extend(
            self.path_segments
                .into_iter()
                .map(|segment| CoapOption::new(OptionNumber::URI_PATH, segment)),
        );
        options.extend(self.options);

        CoapRequest {
            method: self.method,
            path,
            options,
            confirmable: self.confirmable,
            expects_success: self.expects_success,
            accepts_blockwise_transfer: self.accepts_blockwise_transfer,
            body: self.body,
            parameters: self.parameters,
        }
    }
}
