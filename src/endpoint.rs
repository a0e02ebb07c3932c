use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::code::{
    ClientErrorCode, CoapCode, Method, ResponseCode, ServerErrorCode, SuccessCode,
};
use crate::driver::{
    DriverError, FilterGroup, InboundRequestSink, RawMessage, RequestDriver, ServerResponse,
};
use crate::message::{CoapMessage, ExtendedError, MessageBody, MessageError};
use crate::option::{CoapOption, OptionNumber, OptionValue};
use crate::readiness::{NotReadyReason, ReadinessWatch, TransportReadiness};
use crate::request::CoapRequest;
use crate::transfer;

/// Errors surfaced to the caller of a request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// The transport cannot currently carry data.
    ///
    /// Not retried internally; retrying is the connection layer's business.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(NotReadyReason),
    /// The response left the success class while the request expected
    /// success
    #[error("response not successful: {code}")]
    ResponseNotSuccessful {
        /// The response code
        code: CoapCode,
        /// Machine-readable error decoration, if the payload carried one
        extended: Option<ExtendedError>,
    },
    /// The response failed protocol-level validation
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The driver reported a failure
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors registering a server-side resource
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegisterError {
    /// A handler is already registered under this path
    #[error("a handler is already registered for {path}")]
    DuplicatePath {
        /// The contested path
        path: String,
    },
    /// The driver rejected the registration
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// A CoAP endpoint over an intermittently-available transport, acting as
/// both client and server.
///
/// Requests are gated on transport readiness, dispatched through the simple
/// or blockwise transfer strategy, and classified against the caller's
/// success expectation. Dropping the future returned by
/// [`response`](Self::response) cancels the outstanding driver request.
///
/// Handles are cheap clones sharing one driver.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    driver: Arc<dyn RequestDriver>,
    readiness: ReadinessWatch,
    runtime: Handle,
    registrations: Mutex<FxHashSet<String>>,
}

impl Endpoint {
    /// Creates an endpoint on top of a driver.
    ///
    /// Endpoints start with the authenticated filter group admitted. Must be
    /// called within a Tokio runtime; server handlers run on that runtime.
    pub fn new(driver: Arc<dyn RequestDriver>, readiness: ReadinessWatch) -> Self {
        driver.set_filter_group(FilterGroup::Authenticated);
        Self {
            inner: Arc::new(EndpointInner {
                driver,
                readiness,
                runtime: Handle::current(),
                registrations: Mutex::new(FxHashSet::default()),
            }),
        }
    }

    /// Sends a request and resolves with the response message.
    ///
    /// Fails immediately with [`RequestError::TransportUnavailable`] if the
    /// transport is not ready, and cancels the in-flight exchange if
    /// readiness is lost while awaiting the response; response arrival and
    /// readiness loss race, first terminal event wins.
    pub async fn response(&self, request: CoapRequest) -> Result<CoapMessage, RequestError> {
        let label = request.to_string();
        let mut readiness = self.inner.readiness.clone();
        if let TransportReadiness::NotReady(reason) = readiness.current() {
            warn!(request = %label, %reason, "request could not be fulfilled, transport unavailable");
            return Err(RequestError::TransportUnavailable(reason));
        }

        let response = async {
            if request.accepts_blockwise_transfer {
                transfer::blockwise_response(&self.inner.driver, &self.inner.readiness, &request)
                    .await
            } else {
                transfer::simple_response(&self.inner.driver, &request).await
            }
        };
        tokio::pin!(response);

        let mut message = tokio::select! {
            result = &mut response => result?,
            reason = readiness.unavailable() => {
                warn!(request = %label, %reason, "request could not be fulfilled, transport unavailable");
                return Err(RequestError::TransportUnavailable(reason));
            }
        };

        if request.expects_success && !message.code.is_success() {
            let code = message.code;
            // forward the extended error, if any
            let extended = message.extended_error().await;
            debug!(request = %label, %code, "response not successful");
            return Err(RequestError::ResponseNotSuccessful { code, extended });
        }
        Ok(message)
    }

    /// Installs a resource handler for `path`.
    ///
    /// The handler is invoked for each inbound request matching the path
    /// until the returned registration is dropped.
    pub fn register(
        &self,
        path: impl Into<String>,
        resource: Arc<dyn CoapResource>,
    ) -> Result<Registration, RegisterError> {
        let path = path.into();
        {
            let mut registrations = self.inner.registrations.lock().unwrap();
            if !registrations.insert(path.clone()) {
                return Err(RegisterError::DuplicatePath { path });
            }
        }

        let sink = Arc::new(ResourceSink {
            resource,
            runtime: self.inner.runtime.clone(),
        });
        if let Err(error) = self.inner.driver.register_handler(&path, sink) {
            self.inner.registrations.lock().unwrap().remove(&path);
            return Err(error.into());
        }
        debug!(%path, "resource handler registered");
        Ok(Registration {
            endpoint: self.inner.clone(),
            path,
        })
    }

    /// Switches which request-filter group is currently admitted
    pub fn set_request_filter_group(&self, group: FilterGroup) {
        debug!(%group, "switching request filter group");
        self.inner.driver.set_filter_group(group);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("readiness", &self.inner.readiness.current())
            .finish_non_exhaustive()
    }
}

/// Keeps a resource handler installed; unregisters it on drop
pub struct Registration {
    endpoint: Arc<EndpointInner>,
    path: String,
}

impl Registration {
    /// The path the handler is registered under
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.endpoint.driver.unregister_handler(&self.path);
        self.endpoint
            .registrations
            .lock()
            .unwrap()
            .remove(&self.path);
        debug!(path = %self.path, "resource handler unregistered");
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A server-side resource.
///
/// Response codes are pre-populated per method before the handler runs (GET
/// answers 2.05 Content, DELETE answers 2.02 Deleted; POST and PUT carry no
/// preset since creation versus modification is ambiguous) and may be
/// overridden through the builder. Methods a resource does not implement
/// answer 4.05 Method Not Allowed through the default implementations.
#[async_trait]
pub trait CoapResource: Send + Sync + 'static {
    /// Handles GET
    async fn on_get(&self, request: CoapMessage, response: ResponseBuilder) -> ServerResponse {
        let _ = request;
        response.method_not_allowed()
    }

    /// Handles POST
    async fn on_post(&self, request: CoapMessage, response: ResponseBuilder) -> ServerResponse {
        let _ = request;
        response.method_not_allowed()
    }

    /// Handles PUT
    async fn on_put(&self, request: CoapMessage, response: ResponseBuilder) -> ServerResponse {
        let _ = request;
        response.method_not_allowed()
    }

    /// Handles DELETE
    async fn on_delete(&self, request: CoapMessage, response: ResponseBuilder) -> ServerResponse {
        let _ = request;
        response.method_not_allowed()
    }
}

/// Builds a server response, carrying the request's message id and token
/// through to the driver.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    code: CoapCode,
    options: Vec<CoapOption>,
    payload: Option<Bytes>,
    message_id: u16,
    token: Bytes,
}

impl ResponseBuilder {
    pub(crate) fn for_request(request: &RawMessage) -> Self {
        Self {
            code: CoapCode::Response(ResponseCode::Success(SuccessCode::Success)),
            options: Vec::new(),
            payload: None,
            message_id: request.message_id,
            token: request.token.clone(),
        }
    }

    /// Sets the response code, replacing any preset
    pub fn response_code(mut self, code: ResponseCode) -> Self {
        self.code = CoapCode::Response(code);
        self
    }

    /// Appends an option
    pub fn option(mut self, number: OptionNumber, value: impl Into<OptionValue>) -> Self {
        self.options.push(CoapOption::new(number, value));
        self
    }

    /// Sets the payload
    pub fn body(mut self, data: impl Into<Bytes>) -> Self {
        self.payload = Some(data.into());
        self
    }

    /// Finishes as a 4.05 Method Not Allowed response
    pub fn method_not_allowed(self) -> ServerResponse {
        self.response_code(ResponseCode::ClientError(ClientErrorCode::MethodNotAllowed))
            .build()
    }

    /// Builds the response
    pub fn build(self) -> ServerResponse {
        ServerResponse {
            code: self.code,
            options: self.options,
            payload: self.payload,
            message_id: self.message_id,
            token: self.token,
        }
    }
}

/// Bridges the driver's synchronous callback to the asynchronous resource.
///
/// The driver callback cannot suspend, so the callback thread is parked
/// until the handler-produced result resolves on the runtime.
struct ResourceSink {
    resource: Arc<dyn CoapResource>,
    runtime: Handle,
}

impl InboundRequestSink for ResourceSink {
    fn handle(&self, request: RawMessage) -> ServerResponse {
        let builder = ResponseBuilder::for_request(&request);
        let method = match request.coap_code() {
            Ok(CoapCode::Request(method)) => method,
            Ok(code) => {
                error!(%code, "inbound message is not a request");
                return builder
                    .response_code(ResponseCode::ClientError(ClientErrorCode::BadRequest))
                    .build();
            }
            Err(error) => {
                error!(%error, "inbound message failed validation");
                return builder
                    .response_code(ResponseCode::ClientError(ClientErrorCode::BadRequest))
                    .build();
            }
        };

        let body = match request.payload.clone() {
            Some(payload) => MessageBody::from_bytes(payload),
            None => MessageBody::empty(),
        };
        let message = CoapMessage::new(CoapCode::Request(method), request.options.clone(), body);

        // standard response codes matching the method; the handler may still
        // override them
        let builder = match method {
            Method::Get => builder.response_code(ResponseCode::Success(SuccessCode::Content)),
            Method::Delete => builder.response_code(ResponseCode::Success(SuccessCode::Deleted)),
            Method::Post | Method::Put => builder,
        };

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let resource = self.resource.clone();
        self.runtime.spawn(async move {
            let response = match method {
                Method::Get => resource.on_get(message, builder).await,
                Method::Post => resource.on_post(message, builder).await,
                Method::Put => resource.on_put(message, builder).await,
                Method::Delete => resource.on_delete(message, builder).await,
            };
            let _ = tx.send(response);
        });

        match rx.recv() {
            Ok(response) => response,
            Err(_) => {
                error!("resource handler terminated without responding");
                ServerResponse {
                    code: CoapCode::Response(ResponseCode::ServerError(
                        ServerErrorCode::InternalServerError,
                    )),
                    options: Vec::new(),
                    payload: None,
                    message_id: request.message_id,
                    token: request.token,
                }
            }
        }
    }
}
