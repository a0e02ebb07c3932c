use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::task::yield_now;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

use crate::{
    readiness_channel, BlockInfo, BlockSource, BlockwiseResponseListener, CoapCode, CoapMessage,
    CoapOption, CoapRequestBuilder, CoapResource, DriverError, Endpoint, ExtendedError,
    FilterGroup, InboundRequestSink, MessageKind, Method, NotReadyReason, OptionNumber,
    OptionParams, RawMessage, ReadinessWatch, RegisterError, RequestDriver, RequestError,
    RequestHandle, RequestParameters, ResponseBuilder, ResponseCode, ResponseListener,
    ServerResponse, SuccessCode, TransportReadiness,
};

fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

#[derive(Default)]
struct MockDriver {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    simple: FxHashMap<u64, Arc<dyn ResponseListener>>,
    blockwise: FxHashMap<u64, Arc<dyn BlockwiseResponseListener>>,
    sources: FxHashMap<u64, Option<Arc<dyn BlockSource>>>,
    cancelled: Vec<u64>,
    handlers: FxHashMap<String, Arc<dyn InboundRequestSink>>,
    filter_group: Option<FilterGroup>,
    sent: Vec<(Method, Vec<CoapOption>, Bytes)>,
}

impl MockDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn simple_listener(&self, handle: u64) -> Option<Arc<dyn ResponseListener>> {
        self.state.lock().unwrap().simple.get(&handle).cloned()
    }

    fn blockwise_listener(&self, handle: u64) -> Option<Arc<dyn BlockwiseResponseListener>> {
        self.state.lock().unwrap().blockwise.get(&handle).cloned()
    }

    fn block_source(&self, handle: u64) -> Option<Arc<dyn BlockSource>> {
        self.state.lock().unwrap().sources.get(&handle).cloned()?
    }

    fn handler(&self, path: &str) -> Option<Arc<dyn InboundRequestSink>> {
        self.state.lock().unwrap().handlers.get(path).cloned()
    }

    fn cancelled(&self) -> Vec<u64> {
        self.state.lock().unwrap().cancelled.clone()
    }

    fn sent(&self) -> Vec<(Method, Vec<CoapOption>, Bytes)> {
        self.state.lock().unwrap().sent.clone()
    }

    fn filter_group(&self) -> Option<FilterGroup> {
        self.state.lock().unwrap().filter_group
    }
}

impl RequestDriver for MockDriver {
    fn send_request(
        &self,
        method: Method,
        options: OptionParams,
        payload: Bytes,
        _parameters: Option<RequestParameters>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<RequestHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.sent.push((method, options.into_vec(), payload));
        state.simple.insert(handle, listener);
        Ok(RequestHandle(handle))
    }

    fn send_blockwise_request(
        &self,
        method: Method,
        options: OptionParams,
        body: Option<Arc<dyn BlockSource>>,
        _parameters: Option<RequestParameters>,
        listener: Arc<dyn BlockwiseResponseListener>,
    ) -> Result<RequestHandle, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.sent.push((method, options.into_vec(), Bytes::new()));
        state.blockwise.insert(handle, listener);
        state.sources.insert(handle, body);
        Ok(RequestHandle(handle))
    }

    fn cancel_request(&self, handle: RequestHandle) {
        let mut state = self.state.lock().unwrap();
        state.simple.remove(&handle.0);
        state.cancelled.push(handle.0);
    }

    fn cancel_blockwise_request(&self, handle: RequestHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.blockwise.remove(&handle.0).is_none() {
            return Err(DriverError::NoSuchItem);
        }
        state.cancelled.push(handle.0);
        Ok(())
    }

    fn register_handler(
        &self,
        path: &str,
        sink: Arc<dyn InboundRequestSink>,
    ) -> Result<(), DriverError> {
        self.state
            .lock()
            .unwrap()
            .handlers
            .insert(path.to_owned(), sink);
        Ok(())
    }

    fn unregister_handler(&self, path: &str) {
        self.state.lock().unwrap().handlers.remove(path);
    }

    fn set_filter_group(&self, group: FilterGroup) {
        self.state.lock().unwrap().filter_group = Some(group);
    }
}

fn response(code: u8, payload: Option<Bytes>) -> RawMessage {
    RawMessage {
        code,
        kind: MessageKind::Acknowledgement,
        options: Vec::new(),
        message_id: rand::thread_rng().gen(),
        token: Bytes::from_static(b"token"),
        payload,
    }
}

fn request_message(method: Method, payload: Option<Bytes>) -> RawMessage {
    RawMessage {
        code: CoapCode::Request(method).to_raw(),
        kind: MessageKind::Confirmable,
        options: vec![CoapOption::new(OptionNumber::URI_PATH, "ping")],
        message_id: rand::thread_rng().gen(),
        token: Bytes::from_static(b"req-token"),
        payload,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        yield_now().await;
    }
    panic!("condition never became true");
}

const CONTENT: u8 = 0x45;
const NOT_FOUND: u8 = 0x84;

#[tokio::test]
async fn rejects_requests_while_the_transport_is_not_ready() {
    let _guard = subscribe();
    let driver = MockDriver::new();
    let (_tx, readiness) =
        readiness_channel(TransportReadiness::NotReady(NotReadyReason::Connecting));
    let endpoint = Endpoint::new(driver.clone(), readiness);

    let error = endpoint
        .response(CoapRequestBuilder::new().path(["ping"]).build())
        .await
        .unwrap_err();
    assert_eq!(
        error,
        RequestError::TransportUnavailable(NotReadyReason::Connecting)
    );
    // nothing must have reached the driver
    assert!(driver.sent().is_empty());
}

#[tokio::test]
async fn delivers_simple_responses() {
    let _guard = subscribe();
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    let request = CoapRequestBuilder::new()
        .option(OptionNumber::CONTENT_FORMAT, 0u32)
        .path(["hello", "world"])
        .accepts_blockwise_transfer(false)
        .body("ping")
        .build();
    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.response(request).await }
    });

    wait_until(|| driver.simple_listener(1).is_some()).await;

    // uri-path options were prepended ahead of the explicit option
    let (method, options, payload) = driver.sent().remove(0);
    assert_eq!(method, Method::Get);
    assert_eq!(options[0], CoapOption::new(OptionNumber::URI_PATH, "hello"));
    assert_eq!(options[1], CoapOption::new(OptionNumber::URI_PATH, "world"));
    assert_eq!(
        options[2],
        CoapOption::new(OptionNumber::CONTENT_FORMAT, 0u32)
    );
    assert_eq!(payload, Bytes::from_static(b"ping"));

    driver
        .simple_listener(1)
        .unwrap()
        .on_response(response(CONTENT, Some(Bytes::from_static(b"pong"))));

    let mut message = pending.await.unwrap().unwrap();
    assert_eq!(
        message.code,
        CoapCode::Response(ResponseCode::Success(SuccessCode::Content))
    );
    assert_eq!(message.body.bytes().await.unwrap(), Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn classifies_unsuccessful_responses() {
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    let extended = ExtendedError {
        namespace: "com.example".to_owned(),
        code: 42,
        message: None,
    };
    let payload = extended.encode();

    let request = CoapRequestBuilder::new()
        .path(["missing"])
        .accepts_blockwise_transfer(false)
        .build();
    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.response(request).await }
    });

    wait_until(|| driver.simple_listener(1).is_some()).await;
    driver
        .simple_listener(1)
        .unwrap()
        .on_response(response(NOT_FOUND, Some(payload)));

    match pending.await.unwrap().unwrap_err() {
        RequestError::ResponseNotSuccessful { code, extended: decoded } => {
            assert_eq!(code.http_equivalent(), 404);
            assert_eq!(decoded, Some(extended));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn passes_unsuccessful_responses_through_when_success_is_not_expected() {
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    let request = CoapRequestBuilder::new()
        .path(["missing"])
        .expects_success(false)
        .accepts_blockwise_transfer(false)
        .build();
    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.response(request).await }
    });

    wait_until(|| driver.simple_listener(1).is_some()).await;
    driver
        .simple_listener(1)
        .unwrap()
        .on_response(response(NOT_FOUND, None));

    let message = pending.await.unwrap().unwrap();
    assert_eq!(message.code.http_equivalent(), 404);
}

#[tokio::test]
async fn cancels_the_exchange_when_readiness_is_lost() {
    let _guard = subscribe();
    let driver = MockDriver::new();
    let (tx, readiness) = readiness_channel(TransportReadiness::Ready);
    let endpoint = Endpoint::new(driver.clone(), readiness);

    let request = CoapRequestBuilder::new()
        .path(["slow"])
        .accepts_blockwise_transfer(false)
        .build();
    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.response(request).await }
    });

    wait_until(|| driver.simple_listener(1).is_some()).await;
    tx.send(TransportReadiness::NotReady(NotReadyReason::Disconnected))
        .unwrap();

    assert_eq!(
        pending.await.unwrap().unwrap_err(),
        RequestError::TransportUnavailable(NotReadyReason::Disconnected)
    );
    // the in-flight driver request was cancelled
    assert_eq!(driver.cancelled(), vec![1]);
}

#[tokio::test]
async fn dropping_the_response_future_cancels_the_request() {
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    {
        let request = CoapRequestBuilder::new()
            .path(["abandoned"])
            .accepts_blockwise_transfer(false)
            .build();
        let response = endpoint.response(request);
        tokio::pin!(response);
        tokio::select! {
            _ = &mut response => panic!("no response was provided"),
            _ = wait_until(|| driver.simple_listener(1).is_some()) => {}
        }
    }

    assert_eq!(driver.cancelled(), vec![1]);
}

#[tokio::test]
async fn assembles_blockwise_responses() {
    let _guard = subscribe();
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    let progress = Arc::new(Mutex::new(Vec::new()));
    let request = CoapRequestBuilder::new()
        .path(["blob"])
        .method(Method::Put)
        .body_with_progress(Bytes::from(vec![7u8; 32]), {
            let progress = progress.clone();
            Arc::new(move |fraction| progress.lock().unwrap().push(fraction))
        })
        .build();

    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.response(request).await }
    });
    wait_until(|| driver.blockwise_listener(1).is_some()).await;

    // drive the outgoing body the way the native block protocol would
    let source = driver.block_source(1).unwrap();
    assert_eq!(source.chunk_size(0, 16).unwrap(), (16, true));
    assert_eq!(source.read_chunk(0, 16).unwrap().len(), 16);
    assert_eq!(source.chunk_size(16, 16).unwrap(), (16, false));
    assert_eq!(source.read_chunk(16, 16).unwrap().len(), 16);
    assert_eq!(*progress.lock().unwrap(), vec![0.5, 1.0]);

    let listener = driver.blockwise_listener(1).unwrap();
    listener.on_response_block(
        BlockInfo {
            offset: 0,
            size: 16,
            more: true,
        },
        response(CONTENT, Some(Bytes::from_static(b"1234567812345678"))),
    );
    listener.on_response_block(
        BlockInfo {
            offset: 16,
            size: 16,
            more: false,
        },
        response(CONTENT, Some(Bytes::from_static(b"ABCDEFGH"))),
    );

    let mut message = pending.await.unwrap().unwrap();
    assert_eq!(
        message.body.bytes().await.unwrap(),
        Bytes::from_static(b"1234567812345678ABCDEFGH")
    );
}

#[tokio::test]
async fn dispatches_inbound_requests_to_resources() {
    let _guard = subscribe();
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    struct Ping;

    #[async_trait::async_trait]
    impl CoapResource for Ping {
        async fn on_get(
            &self,
            _request: CoapMessage,
            response: ResponseBuilder,
        ) -> ServerResponse {
            // keep the preset 2.05 Content code
            response.body("pong").build()
        }
    }

    let registration = endpoint.register("ping", Arc::new(Ping)).unwrap();

    let sink = driver.handler("ping").unwrap();
    let request = request_message(Method::Get, None);
    let token = request.token.clone();
    let served = tokio::task::spawn_blocking(move || sink.handle(request))
        .await
        .unwrap();

    assert_eq!(
        served.code,
        CoapCode::Response(ResponseCode::Success(SuccessCode::Content))
    );
    assert_eq!(served.payload, Some(Bytes::from_static(b"pong")));
    assert_eq!(served.token, token);

    // methods the resource does not implement answer 4.05
    let sink = driver.handler("ping").unwrap();
    let served = tokio::task::spawn_blocking(move || {
        sink.handle(request_message(Method::Post, Some(Bytes::from_static(b"x"))))
    })
    .await
    .unwrap();
    assert_eq!(served.code.http_equivalent(), 405);

    // DELETE gets its own preset
    struct Wiper;

    #[async_trait::async_trait]
    impl CoapResource for Wiper {
        async fn on_delete(
            &self,
            _request: CoapMessage,
            response: ResponseBuilder,
        ) -> ServerResponse {
            response.build()
        }
    }

    let wiper = endpoint.register("wipe", Arc::new(Wiper)).unwrap();
    let sink = driver.handler("wipe").unwrap();
    let served = tokio::task::spawn_blocking(move || sink.handle(request_message(Method::Delete, None)))
        .await
        .unwrap();
    assert_eq!(
        served.code,
        CoapCode::Response(ResponseCode::Success(SuccessCode::Deleted))
    );

    drop(wiper);
    drop(registration);
    assert!(driver.handler("ping").is_none());
    assert!(driver.handler("wipe").is_none());
}

#[tokio::test]
async fn rejects_duplicate_registrations() {
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    struct Quiet;
    impl CoapResource for Quiet {}

    let first = endpoint.register("busy", Arc::new(Quiet)).unwrap();
    match endpoint.register("busy", Arc::new(Quiet)) {
        Err(RegisterError::DuplicatePath { path }) => assert_eq!(path, "busy"),
        other => panic!("unexpected result {other:?}"),
    }

    // the path frees up once the registration is dropped
    drop(first);
    let _second = endpoint.register("busy", Arc::new(Quiet)).unwrap();
}

#[tokio::test]
async fn manages_the_request_filter_group() {
    let driver = MockDriver::new();
    let endpoint = Endpoint::new(driver.clone(), ReadinessWatch::always_ready());

    // endpoints come up with the authenticated group admitted
    assert_eq!(driver.filter_group(), Some(FilterGroup::Authenticated));

    endpoint.set_request_filter_group(FilterGroup::Unauthenticated);
    assert_eq!(driver.filter_group(), Some(FilterGroup::Unauthenticated));
}
