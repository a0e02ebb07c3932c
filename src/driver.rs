//! The boundary to the protocol-framing driver.
//!
//! The driver owns byte-level CoAP framing, block-size negotiation and
//! request-handle lifecycle; this crate orchestrates on top of it. Listener
//! objects are handed over as trait objects and must be kept alive until the
//! driver acknowledges cancellation, which the `Arc` handover guarantees.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::code::{CoapCode, Method};
use crate::message::MessageError;
use crate::option::{CoapOption, OptionParams};
use crate::request::RequestParameters;

/// Identifies an outstanding request within the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Which request-filter group is currently admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterGroup {
    /// Requests admitted before the peer authenticated
    Unauthenticated,
    /// Requests admitted once the peer authenticated
    Authenticated,
}

/// Position of one block within a blockwise exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Byte offset of this block within the whole body
    pub offset: usize,
    /// Size of this block
    pub size: usize,
    /// Whether more blocks follow
    pub more: bool,
}

/// Message type at the driver boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Requires an acknowledgement
    Confirmable,
    /// Fire-and-forget
    NonConfirmable,
    /// Acknowledges a confirmable message
    Acknowledgement,
    /// Rejects a message
    Reset,
}

/// A message as decoded by the driver, before protocol-level validation
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Raw 8-bit message code
    pub code: u8,
    /// Message type
    pub kind: MessageKind,
    /// Options in wire order
    pub options: Vec<CoapOption>,
    /// Message identifier
    pub message_id: u16,
    /// Request/response matching token
    pub token: Bytes,
    /// Payload, if any
    pub payload: Option<Bytes>,
}

impl RawMessage {
    /// Validates the raw code into a [`CoapCode`]
    pub fn coap_code(&self) -> Result<CoapCode, MessageError> {
        CoapCode::from_raw(self.code)
    }
}

/// Errors reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The driver reported a failure, optionally with a diagnostic message
    #[error("driver failure ({code}){}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Failure {
        /// Driver-specific result code
        code: i32,
        /// Diagnostic message, if the driver provided one
        message: Option<String>,
    },
    /// The referenced item no longer exists
    #[error("no such item")]
    NoSuchItem,
    /// An offset fell outside the addressed resource
    #[error("offset out of range")]
    OutOfRange,
    /// The operation would block; retry when the driver signals writability
    #[error("would block")]
    WouldBlock,
}

/// Receives the outcome of a non-blockwise request
pub trait ResponseListener: Send + Sync + 'static {
    /// The request was acknowledged; the response is still outstanding
    fn on_ack(&self) {}

    /// The complete response arrived
    fn on_response(&self, message: RawMessage);

    /// The exchange failed
    fn on_error(&self, error: DriverError);
}

/// Receives callbacks whenever a new response block arrives for an earlier
/// blockwise request.
pub trait BlockwiseResponseListener: Send + Sync + 'static {
    /// A response block arrived; blocks are delivered in order
    fn on_response_block(&self, block: BlockInfo, message: RawMessage);

    /// The exchange failed
    fn on_error(&self, error: DriverError);
}

/// Supplies chunks of an outgoing blockwise body
pub trait BlockSource: Send + Sync + 'static {
    /// Adjusts the driver's preferred chunk size at `offset` against the
    /// body's total length, yielding the actual chunk size and whether more
    /// blocks follow.
    fn chunk_size(&self, offset: usize, preferred_size: usize)
        -> Result<(usize, bool), DriverError>;

    /// Reads the chunk at `offset`
    fn read_chunk(&self, offset: usize, size: usize) -> Result<Bytes, DriverError>;
}

/// A fully-formed server response handed back to the driver
#[derive(Debug, Clone)]
pub struct ServerResponse {
    /// Response code
    pub code: CoapCode,
    /// Options in transmission order
    pub options: Vec<CoapOption>,
    /// Payload, if any
    pub payload: Option<Bytes>,
    /// Message identifier of the request being answered
    pub message_id: u16,
    /// Token of the request being answered
    pub token: Bytes,
}

/// Handles one inbound request on the driver's callback thread.
///
/// The driver's callback cannot suspend, so implementations block the
/// calling thread until their (possibly asynchronous) result resolves.
pub trait InboundRequestSink: Send + Sync + 'static {
    /// Produces the response for an inbound request
    fn handle(&self, request: RawMessage) -> ServerResponse;
}

/// The protocol-framing driver.
///
/// Implementations wrap the native engine; tests substitute an in-memory
/// double.
pub trait RequestDriver: Send + Sync + 'static {
    /// Sends a single-message request; the listener observes the outcome
    fn send_request(
        &self,
        method: Method,
        options: OptionParams,
        payload: Bytes,
        parameters: Option<RequestParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, DriverError>;

    /// Starts a blockwise request; the body, if any, is pulled from the
    /// block source chunk by chunk
    fn send_blockwise_request(
        &self,
        method: Method,
        options: OptionParams,
        body: Option<Arc<dyn BlockSource>>,
        parameters: Option<RequestParameters>,
        listener: Arc<dyn BlockwiseResponseListener>,
    ) -> Result<RequestHandle, DriverError>;

    /// Cancels an outstanding single-message request
    fn cancel_request(&self, handle: RequestHandle);

    /// Cancels an outstanding blockwise request.
    ///
    /// May report [`DriverError::NoSuchItem`] if the driver already removed
    /// the request.
    fn cancel_blockwise_request(&self, handle: RequestHandle) -> Result<(), DriverError>;

    /// Installs a handler invoked for each inbound request matching `path`
    fn register_handler(
        &self,
        path: &str,
        sink: Arc<dyn InboundRequestSink>,
    ) -> Result<(), DriverError>;

    /// Removes the handler registered under `path`
    fn unregister_handler(&self, path: &str);

    /// Switches which request-filter group is admitted
    fn set_filter_group(&self, group: FilterGroup);
}

impl fmt::Display for FilterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
        })
    }
}
