use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

use crate::cache::CacheStream;
use crate::code::CoapCode;
use crate::driver::DriverError;
use crate::option::{CoapOption, OptionNumber};
use crate::readiness::{NotReadyReason, ReadinessWatch};
use crate::transfer::RequestGuard;

/// Protocol-level message validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The raw 8-bit code is not assigned
    #[error("unexpected message code {code:#04x}")]
    UnexpectedCode {
        /// The offending raw code
        code: u8,
    },
}

/// Errors observed while consuming a message body
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BodyError {
    /// The body was already consumed
    #[error("body already consumed")]
    AlreadyUsed,
    /// The transport became unavailable before the body completed
    #[error("transport unavailable: {0}")]
    TransportUnavailable(NotReadyReason),
    /// A later block left the success class, aborting the body
    #[error("response not successful: {code}")]
    ResponseNotSuccessful {
        /// The failing response code
        code: CoapCode,
        /// Machine-readable error decoration, if the payload carried one
        extended: Option<ExtendedError>,
    },
    /// The driver reported a failure mid-stream
    #[error(transparent)]
    Driver(DriverError),
    /// A block carried an invalid message
    #[error(transparent)]
    Message(MessageError),
}

/// A received CoAP message
#[derive(Debug)]
pub struct CoapMessage {
    /// The message code
    pub code: CoapCode,
    /// Options in wire order
    pub options: Vec<CoapOption>,
    /// The message body
    pub body: MessageBody,
}

impl CoapMessage {
    /// Creates a message
    pub fn new(code: CoapCode, options: Vec<CoapOption>, body: MessageBody) -> Self {
        Self {
            code,
            options,
            body,
        }
    }

    /// The first option with the given number, if present
    pub fn option(&self, number: OptionNumber) -> Option<&CoapOption> {
        self.options.iter().find(|option| option.number == number)
    }

    /// The request path, joined from the uri-path options
    pub fn path(&self) -> String {
        let mut path = String::new();
        for option in &self.options {
            if option.number == OptionNumber::URI_PATH {
                if let Some(segment) = option.value.as_str() {
                    path.push('/');
                    path.push_str(segment);
                }
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Opportunistically decodes an [`ExtendedError`] from the body.
    ///
    /// Consumes the body; any body or decode failure yields `None` rather
    /// than an error of its own.
    pub async fn extended_error(&mut self) -> Option<ExtendedError> {
        let payload = self.body.bytes().await.ok()?;
        ExtendedError::decode(&payload)
    }
}

impl fmt::Display for CoapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoapMessage({}, {} options)", self.code, self.options.len())
    }
}

/// A message body, either held in memory or still streaming in.
///
/// Both shapes can be resolved as a single buffer or consumed as an
/// incremental stream; a body can only be consumed once.
#[derive(Debug)]
pub struct MessageBody(BodyInner);

#[derive(Debug)]
enum BodyInner {
    Static(StaticState),
    Streaming(BodyReader),
}

#[derive(Debug)]
enum StaticState {
    Fresh(Bytes),
    /// The single chunk was handed out; the end-of-stream marker is next
    Drained,
    Consumed,
}

impl MessageBody {
    /// An empty in-memory body
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// An in-memory body
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self(BodyInner::Static(StaticState::Fresh(data.into())))
    }

    pub(crate) fn streaming(reader: BodyReader) -> Self {
        Self(BodyInner::Streaming(reader))
    }

    pub(crate) fn attach_guard(&mut self, guard: Arc<RequestGuard>) {
        if let BodyInner::Streaming(reader) = &mut self.0 {
            reader.guard = Some(guard);
        }
    }

    /// Resolves the whole body as a single buffer.
    ///
    /// For streaming bodies this waits until the body completes, racing
    /// completion against transport availability.
    pub async fn bytes(&mut self) -> Result<Bytes, BodyError> {
        match &mut self.0 {
            BodyInner::Static(state) => match std::mem::replace(state, StaticState::Consumed) {
                StaticState::Fresh(data) => Ok(data),
                StaticState::Drained | StaticState::Consumed => Err(BodyError::AlreadyUsed),
            },
            BodyInner::Streaming(reader) => reader.bytes().await,
        }
    }

    /// Yields the next chunk, or `None` once the body is complete.
    ///
    /// Chunks are delivered as produced; for streaming bodies each wait
    /// races against transport availability.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        match &mut self.0 {
            BodyInner::Static(state) => match std::mem::replace(state, StaticState::Consumed) {
                StaticState::Fresh(data) => {
                    *state = StaticState::Drained;
                    Ok(Some(data))
                }
                StaticState::Drained => Ok(None),
                StaticState::Consumed => Err(BodyError::AlreadyUsed),
            },
            BodyInner::Streaming(reader) => reader.next_chunk().await,
        }
    }
}

/// Incrementally consumes a body that is still being filled by the
/// blockwise transfer.
///
/// Holds the underlying request alive until dropped, so cancelling a
/// half-read body also cancels the outstanding blockwise request.
pub(crate) struct BodyReader {
    stream: CacheStream<Bytes, BodyError>,
    readiness: ReadinessWatch,
    finished: bool,
    guard: Option<Arc<RequestGuard>>,
}

impl BodyReader {
    pub(crate) fn new(stream: CacheStream<Bytes, BodyError>, readiness: ReadinessWatch) -> Self {
        Self {
            stream,
            readiness,
            finished: false,
            guard: None,
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        if self.finished {
            return Err(BodyError::AlreadyUsed);
        }
        tokio::select! {
            event = self.stream.next() => match event {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(error)) => {
                    self.finished = true;
                    Err(error)
                }
                None => {
                    self.finished = true;
                    Ok(None)
                }
            },
            reason = self.readiness.unavailable() => {
                warn!(%reason, "abandoning body, transport unavailable");
                self.finished = true;
                Err(BodyError::TransportUnavailable(reason))
            }
        }
    }

    async fn bytes(&mut self) -> Result<Bytes, BodyError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// An application-defined payload decorating an unsuccessful response with a
/// machine-readable code, namespace and message.
///
/// Wire form is a small protobuf message: namespace (field 1), zigzag-varint
/// code (field 2) and message (field 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedError {
    /// Error namespace, e.g. `org.example.foo`
    pub namespace: String,
    /// Error code within the namespace
    pub code: i32,
    /// Human-readable message, if any
    pub message: Option<String>,
}

impl ExtendedError {
    /// Best-effort decode from a response payload
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let mut namespace = None;
        let mut message = None;
        let mut code = 0i32;

        let mut rest = payload;
        while rest.len() >= 2 {
            let key = rest[0];
            rest = &rest[1..];
            let field = key >> 3;
            let wire_type = key & 0b111;

            match field {
                1 | 3 => {
                    if wire_type != 2 {
                        return None;
                    }
                    let (length, consumed) = decode_varint(rest)?;
                    rest = &rest[consumed..];
                    let length = usize::try_from(length).ok()?;
                    if rest.len() < length {
                        return None;
                    }
                    let value = &rest[..length];
                    rest = &rest[length..];
                    if field == 1 {
                        namespace = Some(value);
                    } else {
                        message = Some(value);
                    }
                }
                2 => {
                    if wire_type != 0 {
                        return None;
                    }
                    let (zigzag, consumed) = decode_varint(rest)?;
                    rest = &rest[consumed..];
                    code = zigzag_decode(zigzag);
                }
                _ => {
                    // unknown field: skip
                    match wire_type {
                        0 => {
                            let (_, consumed) = decode_varint(rest)?;
                            rest = &rest[consumed..];
                        }
                        2 => {
                            let (length, consumed) = decode_varint(rest)?;
                            rest = &rest[consumed..];
                            let length = usize::try_from(length).ok()?;
                            if rest.len() < length {
                                return None;
                            }
                            rest = &rest[length..];
                        }
                        _ => return None,
                    }
                }
            }
        }

        Some(Self {
            namespace: std::str::from_utf8(namespace?).ok()?.to_owned(),
            code,
            message: match message {
                Some(value) => Some(std::str::from_utf8(value).ok()?.to_owned()),
                None => None,
            },
        })
    }

    /// Encodes into the wire form
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();

        buffer.put_u8((1 << 3) | 2);
        encode_varint(self.namespace.len() as u64, &mut buffer);
        buffer.extend_from_slice(self.namespace.as_bytes());

        buffer.put_u8(2 << 3);
        encode_varint(zigzag_encode(self.code), &mut buffer);

        if let Some(message) = &self.message {
            buffer.put_u8((3 << 3) | 2);
            encode_varint(message.len() as u64, &mut buffer);
            buffer.extend_from_slice(message.as_bytes());
        }

        buffer.freeze()
    }
}

fn encode_varint(mut value: u64, buffer: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buffer.put_u8(byte);
            return;
        }
        buffer.put_u8(byte | 0x80);
    }
}

fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (index, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

fn zigzag_encode(value: i32) -> u64 {
    let value = i64::from(value);
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(zigzag: u64) -> i32 {
    let value = (zigzag >> 1) as i64 ^ -((zigzag & 1) as i64);
    value as i32
}
