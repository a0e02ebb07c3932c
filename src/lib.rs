//! Reactive CoAP messaging layer for intermittently-available transports
//!
//! [CoAP](https://datatracker.ietf.org/doc/html/rfc7252) is an HTTP-like
//! request/response protocol for constrained networks. This crate turns an
//! unreliable, intermittently-available transport (typically a Bluetooth Low
//! Energy link to a companion device) into a reliable, ordered
//! request/response messaging layer with backpressure and cancellation.
//!
//! The entry point of this crate is the [`Endpoint`]. It builds on a
//! [`RequestDriver`], which implements wire-level CoAP framing and block
//! arithmetic independently of any particular transport; this crate supplies
//! the orchestration on top:
//!
//! - requests are gated on a [`TransportReadiness`] signal and fail fast,
//!   or are cancelled in flight, when the link cannot carry data;
//! - large payloads are exchanged through the blockwise transfer strategy,
//!   which streams the response body while it is still being assembled;
//! - non-success responses are classified against the caller's expectation
//!   and decorated with an opportunistically decoded [`ExtendedError`];
//! - the server role dispatches inbound requests to registered
//!   [`CoapResource`]s with per-method default response codes;
//! - connection-layer failures are classified by a retry strategy with a
//!   sliding-window circuit breaker to keep reconnection storms in check.
//!
//! Everything is cancel-safe by construction: dropping a pending response
//! future, a half-read body or a lock acquisition promptly releases the
//! driver request handles, queue slots and listeners it held.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod cache;
mod code;
mod driver;
mod endpoint;
mod lock;
mod message;
mod option;
mod readiness;
mod reconnect;
mod request;
mod retry;
pub mod signal;
mod transfer;

pub use crate::cache::{AlreadyUsed, CacheStream, SingleUseCache};
pub use crate::code::{
    ClientErrorCode, CoapCode, Method, ResponseCode, ServerErrorCode, SuccessCode,
};
pub use crate::driver::{
    BlockInfo, BlockSource, BlockwiseResponseListener, DriverError, FilterGroup,
    InboundRequestSink, MessageKind, RawMessage, RequestDriver, RequestHandle, ResponseListener,
    ServerResponse,
};
pub use crate::endpoint::{
    CoapResource, Endpoint, RegisterError, Registration, RequestError, ResponseBuilder,
};
pub use crate::lock::{Acquire, FifoLock, FifoLockGuard};
pub use crate::message::{
    BodyError, CoapMessage, ExtendedError, MessageBody, MessageError,
};
pub use crate::option::{CoapOption, OptionNumber, OptionParams, OptionValue};
pub use crate::readiness::{
    readiness_channel, NotReadyReason, ReadinessWatch, TransportReadiness,
};
pub use crate::reconnect::{ConnectivityRetryStrategy, LinkError};
pub use crate::request::{
    CoapRequest, CoapRequestBuilder, OutgoingBody, ProgressCallback, RequestParameters,
};
pub use crate::retry::{
    retry_with, DefaultRetryStrategy, ResumeHandle, ResumeTrigger, RetryDelayConfiguration,
    RetryStrategy, RetryStrategyAction,
};

#[cfg(test)]
mod tests;
