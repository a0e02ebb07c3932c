//! Transfer strategies for the client role.
//!
//! The simple strategy exchanges a single request/response pair. The
//! blockwise strategy streams the outgoing body chunk by chunk through a
//! [`BlockSource`] and reassembles the inbound block sequence into a
//! streamed body, publishing the response headers as soon as the first block
//! arrives.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::cache::SingleUseCache;
use crate::driver::{
    BlockInfo, BlockSource, BlockwiseResponseListener, DriverError, RawMessage, RequestDriver,
    RequestHandle, ResponseListener,
};
use crate::endpoint::RequestError;
use crate::message::{BodyError, BodyReader, CoapMessage, ExtendedError, MessageBody};
use crate::readiness::ReadinessWatch;
use crate::request::{CoapRequest, OutgoingBody, ProgressCallback};

/// Cancels the outstanding request when dropped.
///
/// Also pins the listener: the driver may still invoke it until the
/// cancellation is acknowledged, so it must not be released earlier.
pub(crate) struct RequestGuard {
    driver: Arc<dyn RequestDriver>,
    handle: RequestHandle,
    kind: GuardKind,
}

enum GuardKind {
    Simple { _listener: Arc<dyn ResponseListener> },
    Blockwise { _listener: Arc<dyn BlockwiseResponseListener> },
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        match &self.kind {
            GuardKind::Simple { .. } => self.driver.cancel_request(self.handle),
            GuardKind::Blockwise { .. } => {
                match self.driver.cancel_blockwise_request(self.handle) {
                    // the driver may have removed the request already
                    Ok(()) | Err(DriverError::NoSuchItem) => {}
                    Err(error) => error!(%error, "cancelling blockwise request failed"),
                }
            }
        }
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Single-message exchange, without block negotiation.
///
/// Slightly smaller footprint; neither the request nor the response may be
/// split into blocks.
pub(crate) async fn simple_response(
    driver: &Arc<dyn RequestDriver>,
    request: &CoapRequest,
) -> Result<CoapMessage, RequestError> {
    let cache = SingleUseCache::new();
    let mut stream = cache.attach().expect("fresh response cache had a consumer");
    let listener: Arc<dyn ResponseListener> = Arc::new(SimpleListener { cache });

    let payload = request.body.data().cloned().unwrap_or_default();
    let handle = driver.send_request(
        request.method,
        request.options.clone().into(),
        payload,
        request.parameters,
        listener.clone(),
    )?;
    let _guard = RequestGuard {
        driver: driver.clone(),
        handle,
        kind: GuardKind::Simple {
            _listener: listener,
        },
    };

    match stream.next().await {
        Some(Ok(message)) => Ok(message),
        Some(Err(error)) => Err(error),
        None => Err(stream_ended_early()),
    }
}

/// Blockwise exchange.
///
/// The response headers resolve with the first inbound block; the body keeps
/// streaming afterwards and holds the request alive until fully consumed or
/// dropped.
pub(crate) async fn blockwise_response(
    driver: &Arc<dyn RequestDriver>,
    readiness: &ReadinessWatch,
    request: &CoapRequest,
) -> Result<CoapMessage, RequestError> {
    let block_source: Option<Arc<dyn BlockSource>> = match &request.body {
        OutgoingBody::None => None,
        OutgoingBody::Data { data, progress } => Some(Arc::new(StaticBlockSource::new(
            data.clone(),
            progress.clone(),
        ))),
    };

    let response = SingleUseCache::new();
    let mut stream = response
        .attach()
        .expect("fresh response cache had a consumer");
    let listener: Arc<dyn BlockwiseResponseListener> = Arc::new(BlockwiseListener {
        readiness: readiness.clone(),
        label: request.to_string(),
        state: Mutex::new(ListenerState::WaitingForResponse),
        response,
    });

    let handle = driver.send_blockwise_request(
        request.method,
        request.options.clone().into(),
        block_source,
        request.parameters,
        listener.clone(),
    )?;
    let guard = Arc::new(RequestGuard {
        driver: driver.clone(),
        handle,
        kind: GuardKind::Blockwise {
            _listener: listener,
        },
    });

    match stream.next().await {
        Some(Ok(mut message)) => {
            // the body keeps the request alive while someone holds onto it
            message.body.attach_guard(guard);
            Ok(message)
        }
        Some(Err(error)) => Err(error),
        None => Err(stream_ended_early()),
    }
}

fn stream_ended_early() -> RequestError {
    RequestError::Driver(DriverError::Failure {
        code: 0,
        message: Some("response stream ended without a response".to_owned()),
    })
}

struct SimpleListener {
    cache: SingleUseCache<CoapMessage, RequestError>,
}

impl ResponseListener for SimpleListener {
    fn on_ack(&self) {
        debug!("request acknowledged");
    }

    fn on_response(&self, message: RawMessage) {
        let code = match message.coap_code() {
            Ok(code) => code,
            Err(error) => {
                self.cache.fail(RequestError::Message(error));
                return;
            }
        };
        let body = match message.payload {
            Some(payload) => MessageBody::from_bytes(payload),
            None => MessageBody::empty(),
        };
        self.cache
            .emit(CoapMessage::new(code, message.options, body));
        self.cache.complete();
    }

    fn on_error(&self, error: DriverError) {
        self.cache.fail(RequestError::Driver(error));
    }
}

/// Reassembles an inbound block sequence.
///
/// The first block establishes the response's code and options for the whole
/// exchange and opens the streamed body; subsequent blocks append their
/// payloads in arrival order. Ordering is guaranteed by the driver's block
/// protocol; no resequencing happens here.
struct BlockwiseListener {
    readiness: ReadinessWatch,
    label: String,
    state: Mutex<ListenerState>,
    response: SingleUseCache<CoapMessage, RequestError>,
}

enum ListenerState {
    WaitingForResponse,
    WaitingForEndOfStream(SingleUseCache<Bytes, BodyError>),
    Done,
}

impl BlockwiseListener {
    fn fail(&self, request_error: RequestError, body_error: BodyError) {
        let mut state = self.state.lock().unwrap();
        if let ListenerState::WaitingForEndOfStream(body) = &*state {
            body.fail(body_error);
        }
        // dropped silently if the headers were already delivered
        self.response.fail(request_error);
        *state = ListenerState::Done;
    }
}

impl BlockwiseResponseListener for BlockwiseListener {
    fn on_response_block(&self, block: BlockInfo, message: RawMessage) {
        let code = match message.coap_code() {
            Ok(code) => code,
            Err(error) => {
                self.fail(RequestError::Message(error), BodyError::Message(error));
                return;
            }
        };

        let mut state = self.state.lock().unwrap();
        let body = match std::mem::replace(&mut *state, ListenerState::Done) {
            ListenerState::WaitingForResponse => {
                let body = SingleUseCache::new();
                let reader = BodyReader::new(
                    body.attach().expect("fresh body cache had a consumer"),
                    self.readiness.clone(),
                );
                *state = ListenerState::WaitingForEndOfStream(body.clone());

                debug!(request = %self.label, %code, "first response block received");
                self.response
                    .emit(CoapMessage::new(code, message.options, MessageBody::streaming(reader)));
                self.response.complete();
                body
            }
            ListenerState::WaitingForEndOfStream(body) => {
                // a successful first block does not guarantee a successful
                // last block
                if !code.is_success() {
                    let extended = message.payload.as_deref().and_then(ExtendedError::decode);
                    body.fail(BodyError::ResponseNotSuccessful { code, extended });
                    return;
                }
                *state = ListenerState::WaitingForEndOfStream(body.clone());
                body
            }
            ListenerState::Done => {
                warn!(request = %self.label, "response block received after the exchange completed");
                return;
            }
        };

        if let Some(payload) = message.payload {
            body.emit(payload);
        }

        // complete on the last block, or on an unsuccessful first block
        if !block.more || !code.is_success() {
            body.complete();
            *state = ListenerState::Done;
        }
    }

    fn on_error(&self, error: DriverError) {
        self.fail(
            RequestError::Driver(error.clone()),
            BodyError::Driver(error),
        );
    }
}

/// Chunks an in-memory outgoing body for the driver's block protocol
pub(crate) struct StaticBlockSource {
    data: Bytes,
    progress: Option<ProgressCallback>,
}

impl StaticBlockSource {
    pub(crate) fn new(data: Bytes, progress: Option<ProgressCallback>) -> Self {
        Self { data, progress }
    }
}

impl BlockSource for StaticBlockSource {
    fn chunk_size(
        &self,
        offset: usize,
        preferred_size: usize,
    ) -> Result<(usize, bool), DriverError> {
        if offset >= self.data.len() {
            return Err(DriverError::OutOfRange);
        }
        if offset + preferred_size >= self.data.len() {
            Ok((self.data.len() - offset, false))
        } else {
            Ok((preferred_size, true))
        }
    }

    fn read_chunk(&self, offset: usize, size: usize) -> Result<Bytes, DriverError> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.data.len())
            .ok_or(DriverError::OutOfRange)?;
        let chunk = self.data.slice(offset..end);
        if let Some(progress) = &self.progress {
            progress(end as f64 / self.data.len() as f64);
        }
        Ok(chunk)
    }
}
