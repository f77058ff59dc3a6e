use std::{error::Error, fmt, mem};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};
use tracing::trace;

use super::{MethodRegistry, ServerConfig};
use crate::{
    codec::{CodecError, CompressionEncoding, FrameReader, FrameWriter},
    metadata::{
        self, ContentType, GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER,
    },
    Status, Timeout,
};

/// The server half of one RPC, as a state machine.
///
/// Events from the HTTP/2 stream come in through `receive_*`; the service
/// handler writes through `send_*`. Outputs are header blocks and framed
/// bytes for the caller to put on the wire.
pub struct ServerRpc {
    state: State,
    /// Flush requests coalesced while an inbound read batch is running.
    flush_pending: bool,
    reading_batch: bool,
}

enum State {
    RequestIdleResponseIdle {
        config: Box<ServerConfig>,
    },
    RequestOpenResponseIdle {
        read: ReadState,
        write: WriteConfig,
    },
    RequestOpenResponseOpen {
        read: ReadState,
        write: WriteState,
    },
    RequestClosedResponseIdle {
        write: WriteConfig,
    },
    RequestClosedResponseOpen {
        write: WriteState,
    },
    RequestClosedResponseClosed,
    /// Placeholder installed while a transition moves substate out of the
    /// enum. Never observable.
    Modifying,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::RequestIdleResponseIdle { .. } => "request idle, response idle",
            State::RequestOpenResponseIdle { .. } => "request open, response idle",
            State::RequestOpenResponseOpen { .. } => "request open, response open",
            State::RequestClosedResponseIdle { .. } => "request closed, response idle",
            State::RequestClosedResponseOpen { .. } => "request closed, response open",
            State::RequestClosedResponseClosed => "request closed, response closed",
            State::Modifying => unreachable!("modifying state must never be observed"),
        }
    }
}

struct ReadState {
    reader: FrameReader,
    /// Until the handler reports in, inbound bytes are buffered unparsed.
    configured: bool,
    /// The stream ended before the handler was configured.
    end_pending: bool,
    max_decoding_message_size: usize,
}

impl ReadState {
    fn drain(&mut self) -> Result<Vec<Bytes>, CodecError> {
        let mut messages = Vec::new();
        while let Some(message) = self.reader.next_message(self.max_decoding_message_size)? {
            messages.push(message);
        }
        Ok(messages)
    }
}

struct WriteConfig {
    content_type: ContentType,
    response_encoding: Option<CompressionEncoding>,
    accept_advertisement: Option<HeaderValue>,
}

struct WriteState {
    writer: FrameWriter,
}

/// What to do with an inbound header block.
#[derive(Debug)]
pub enum HeadersAction {
    /// A routable gRPC request: hand the RPC to its handler and call
    /// [`ServerRpc::handler_configured`] once it is ready to read.
    Configure(RpcContext),
    /// The request was rejected; emit this head with END_STREAM and forget
    /// the stream. Carries either a `415` (not gRPC at all) or a
    /// trailers-only gRPC response.
    Reject(http::response::Parts),
}

/// The routing and negotiation outcome handed to the service handler.
#[derive(Debug)]
pub struct RpcContext {
    /// Full `/service/method` path.
    pub path: String,
    /// The service component of the path.
    pub service: String,
    /// The method component of the path.
    pub method: String,
    /// The algorithm inbound messages are compressed with.
    pub request_encoding: CompressionEncoding,
    /// The negotiated response compression, if any.
    pub response_encoding: Option<CompressionEncoding>,
    /// The client's deadline, when one was sent and parseable.
    pub timeout: Option<Timeout>,
}

/// Request messages surfaced to the handler by a read event.
#[derive(Debug, Default)]
pub struct InboundFrames {
    /// Complete messages decoded from the stream, in order.
    pub messages: Vec<Bytes>,
    /// The request stream ended; no further messages will arrive.
    pub end_of_stream: bool,
}

/// Per-message write options.
#[derive(Debug, Clone, Copy)]
pub struct MessageOptions {
    /// Compress this message with the negotiated response encoding.
    pub compress: bool,
    /// Request a transport flush after the message is written.
    pub flush: bool,
}

/// A framed response message, possibly preceded by the response head.
#[derive(Debug)]
pub struct SendAction {
    /// Response headers to write first, when the handler had not sent
    /// metadata explicitly.
    pub headers: Option<http::response::Parts>,
    /// The framed message bytes.
    pub body: Bytes,
    /// Whether to flush now. Requests made during an inbound read batch are
    /// deferred to the end of the batch instead.
    pub flush: bool,
}

/// The final frame of a response.
#[derive(Debug)]
pub enum ResponseEnd {
    /// Normal termination: write this trailers block with END_STREAM.
    Trailers(HeaderMap),
    /// The handler finished before sending any headers: write this single
    /// header block with END_STREAM.
    TrailersOnly(http::response::Parts),
}

/// Errors raised by [`ServerRpc`] operations.
#[derive(Debug)]
pub enum ServerRpcError {
    /// The operation is not valid in the machine's current state.
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state that rejected it.
        state: &'static str,
    },
    /// The RPC already terminated.
    AlreadyComplete,
    /// The request stream ended in the middle of a message frame.
    UnexpectedEndOfStream,
    /// Deframing the request body failed.
    Codec(CodecError),
}

impl fmt::Display for ServerRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRpcError::InvalidState { operation, state } => {
                write!(f, "cannot {operation} while {state}")
            }
            ServerRpcError::AlreadyComplete => write!(f, "rpc is already complete"),
            ServerRpcError::UnexpectedEndOfStream => {
                write!(f, "request stream ended in the middle of a message")
            }
            ServerRpcError::Codec(err) => err.fmt(f),
        }
    }
}

impl Error for ServerRpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerRpcError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for ServerRpcError {
    fn from(err: CodecError) -> Self {
        ServerRpcError::Codec(err)
    }
}

impl From<ServerRpcError> for Status {
    fn from(err: ServerRpcError) -> Status {
        match err {
            ServerRpcError::Codec(codec) => codec.into(),
            other => Status::internal(other.to_string()),
        }
    }
}

impl ServerRpc {
    /// Create the machine for one inbound stream.
    pub fn new(config: ServerConfig) -> Self {
        ServerRpc {
            state: State::RequestIdleResponseIdle {
                config: Box::new(config),
            },
            flush_pending: false,
            reading_batch: false,
        }
    }

    /// Whether the RPC has fully terminated.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::RequestClosedResponseClosed)
    }

    /// Process the request header block.
    pub fn receive_headers(
        &mut self,
        head: &http::request::Parts,
        methods: &MethodRegistry,
    ) -> Result<HeadersAction, ServerRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestIdleResponseIdle { config } => {
                match self.check_headers(head, methods, &config) {
                    Ok((context, read, write)) => {
                        self.state = State::RequestOpenResponseIdle { read, write };
                        Ok(HeadersAction::Configure(context))
                    }
                    Err(reject) => {
                        self.state = State::RequestClosedResponseClosed;
                        Ok(HeadersAction::Reject(reject))
                    }
                }
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "receive request headers",
                    state,
                })
            }
        }
    }

    fn check_headers(
        &self,
        head: &http::request::Parts,
        methods: &MethodRegistry,
        config: &ServerConfig,
    ) -> Result<(RpcContext, ReadState, WriteConfig), http::response::Parts> {
        // Not gRPC at all: answer with a plain 415 and no gRPC status.
        let content_type = head
            .headers
            .get(CONTENT_TYPE)
            .and_then(ContentType::parse)
            .ok_or_else(|| response_parts(StatusCode::UNSUPPORTED_MEDIA_TYPE))?;

        let path = head.uri.path().to_string();
        let (service, method) = match split_path(&path) {
            Some(parts) if methods.contains(&path) => parts,
            _ => {
                let status =
                    Status::unimplemented(format!("'{path}' is not implemented"));
                return Err(trailers_only(&status, content_type));
            }
        };

        let request_encoding =
            CompressionEncoding::from_encoding_header(&head.headers, config.accept_compression)
                .map_err(|status| trailers_only(&status, content_type))?;

        let response_encoding = CompressionEncoding::from_accept_encoding_header(
            &head.headers,
            config.send_compression,
        );

        let timeout = match Timeout::from_header_map(&head.headers) {
            Ok(timeout) => timeout,
            Err(err) => {
                trace!("ignoring unparseable grpc-timeout header: {err}");
                None
            }
        };

        let context = RpcContext {
            service: service.to_string(),
            method: method.to_string(),
            path,
            request_encoding,
            response_encoding,
            timeout,
        };

        let read = ReadState {
            reader: FrameReader::new(Some(request_encoding), config.max_decoding_message_size),
            configured: false,
            end_pending: false,
            max_decoding_message_size: config.max_decoding_message_size,
        };

        let write = WriteConfig {
            content_type,
            response_encoding,
            accept_advertisement: config
                .accept_compression
                .into_accept_encoding_header_value(),
        };

        Ok((context, read, write))
    }

    /// The service handler is ready: start decoding buffered request bytes.
    ///
    /// Returns whatever complete messages were already buffered, and the
    /// end-of-stream flag if the stream ended while the handler was being
    /// set up.
    pub fn handler_configured(&mut self) -> Result<InboundFrames, ServerRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { mut read, write } if !read.configured => {
                read.configured = true;
                match finish_read_event(&mut read) {
                    Ok(frames) => {
                        if frames.end_of_stream {
                            self.state = State::RequestClosedResponseIdle { write };
                        } else {
                            self.state = State::RequestOpenResponseIdle { read, write };
                        }
                        Ok(frames)
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseIdle { write };
                        Err(err)
                    }
                }
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "configure the handler",
                    state,
                })
            }
        }
    }

    /// Feed request body bytes.
    ///
    /// Before the handler is configured the bytes are buffered and nothing is
    /// returned. After a failure or after the RPC completed, inbound data is
    /// ignored.
    pub fn receive_request_buffer(&mut self, data: &[u8]) -> Result<InboundFrames, ServerRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { mut read, write } => {
                read.reader.append(data);
                if !read.configured {
                    self.state = State::RequestOpenResponseIdle { read, write };
                    return Ok(InboundFrames::default());
                }
                match read.drain() {
                    Ok(messages) => {
                        self.state = State::RequestOpenResponseIdle { read, write };
                        Ok(InboundFrames {
                            messages,
                            end_of_stream: false,
                        })
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseIdle { write };
                        Err(err.into())
                    }
                }
            }
            State::RequestOpenResponseOpen { mut read, write } => {
                read.reader.append(data);
                match read.drain() {
                    Ok(messages) => {
                        self.state = State::RequestOpenResponseOpen { read, write };
                        Ok(InboundFrames {
                            messages,
                            end_of_stream: false,
                        })
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseOpen { write };
                        Err(err.into())
                    }
                }
            }
            other => {
                trace!("dropping {} inbound bytes in state {:?}", data.len(), other.name());
                self.state = other;
                Ok(InboundFrames::default())
            }
        }
    }

    /// The request stream ended.
    ///
    /// Drains remaining buffered messages and forwards end-of-stream to the
    /// handler. If the handler is not configured yet, the end is remembered
    /// and surfaced by [`handler_configured`](ServerRpc::handler_configured).
    pub fn receive_end_of_request_stream(&mut self) -> Result<InboundFrames, ServerRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { mut read, write } => {
                read.end_pending = true;
                if !read.configured {
                    self.state = State::RequestOpenResponseIdle { read, write };
                    return Ok(InboundFrames::default());
                }
                match finish_read_event(&mut read) {
                    Ok(frames) => {
                        self.state = State::RequestClosedResponseIdle { write };
                        Ok(frames)
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseIdle { write };
                        Err(err)
                    }
                }
            }
            State::RequestOpenResponseOpen { mut read, write } => {
                read.end_pending = true;
                match finish_read_event(&mut read) {
                    Ok(frames) => {
                        self.state = State::RequestClosedResponseOpen { write };
                        Ok(frames)
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseOpen { write };
                        Err(err)
                    }
                }
            }
            other @ State::RequestClosedResponseClosed => {
                self.state = other;
                Ok(InboundFrames::default())
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "end the request stream",
                    state,
                })
            }
        }
    }

    /// Send the response header block. Valid at most once, before any
    /// message.
    pub fn send_metadata(
        &mut self,
        metadata: &HeaderMap,
    ) -> Result<http::response::Parts, ServerRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { read, write } => {
                let head = response_head(&write, metadata);
                self.state = State::RequestOpenResponseOpen {
                    read,
                    write: WriteState {
                        writer: FrameWriter::new(write.response_encoding),
                    },
                };
                Ok(head)
            }
            State::RequestClosedResponseIdle { write } => {
                let head = response_head(&write, metadata);
                self.state = State::RequestClosedResponseOpen {
                    write: WriteState {
                        writer: FrameWriter::new(write.response_encoding),
                    },
                };
                Ok(head)
            }
            other @ State::RequestClosedResponseClosed => {
                self.state = other;
                Err(ServerRpcError::AlreadyComplete)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "send response metadata",
                    state,
                })
            }
        }
    }

    /// Frame one response message.
    ///
    /// If the handler never sent metadata, the response head is synthesized
    /// and returned alongside the first message.
    pub fn send_message(
        &mut self,
        payload: &[u8],
        options: MessageOptions,
    ) -> Result<SendAction, ServerRpcError> {
        let flush = self.request_flush(options.flush);

        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { read, write } => {
                let head = response_head(&write, &HeaderMap::new());
                let writer = FrameWriter::new(write.response_encoding);
                match writer.encode(payload, options.compress) {
                    Ok(body) => {
                        self.state = State::RequestOpenResponseOpen {
                            read,
                            write: WriteState { writer },
                        };
                        Ok(SendAction {
                            headers: Some(head),
                            body,
                            flush,
                        })
                    }
                    Err(err) => {
                        self.state = State::RequestOpenResponseIdle { read, write };
                        Err(err.into())
                    }
                }
            }
            State::RequestClosedResponseIdle { write } => {
                let head = response_head(&write, &HeaderMap::new());
                let writer = FrameWriter::new(write.response_encoding);
                match writer.encode(payload, options.compress) {
                    Ok(body) => {
                        self.state = State::RequestClosedResponseOpen {
                            write: WriteState { writer },
                        };
                        Ok(SendAction {
                            headers: Some(head),
                            body,
                            flush,
                        })
                    }
                    Err(err) => {
                        self.state = State::RequestClosedResponseIdle { write };
                        Err(err.into())
                    }
                }
            }
            other @ (State::RequestOpenResponseOpen { .. }
            | State::RequestClosedResponseOpen { .. }) => {
                let result = match &other {
                    State::RequestOpenResponseOpen { write, .. } => {
                        write.writer.encode(payload, options.compress)
                    }
                    State::RequestClosedResponseOpen { write } => {
                        write.writer.encode(payload, options.compress)
                    }
                    _ => unreachable!(),
                };
                self.state = other;
                Ok(SendAction {
                    headers: None,
                    body: result?,
                    flush,
                })
            }
            other @ State::RequestClosedResponseClosed => {
                self.state = other;
                Err(ServerRpcError::AlreadyComplete)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "send a response message",
                    state,
                })
            }
        }
    }

    /// Finish the response.
    ///
    /// Emits a trailers block when headers were already sent, or a
    /// trailers-only header block when they were not.
    pub fn send_end(&mut self, status: &Status) -> Result<ResponseEnd, ServerRpcError> {
        if self.reading_batch {
            self.flush_pending = true;
        }

        match mem::replace(&mut self.state, State::Modifying) {
            State::RequestOpenResponseIdle { write, .. }
            | State::RequestClosedResponseIdle { write } => {
                self.state = State::RequestClosedResponseClosed;
                Ok(ResponseEnd::TrailersOnly(trailers_only(
                    status,
                    write.content_type,
                )))
            }
            State::RequestOpenResponseOpen { .. } | State::RequestClosedResponseOpen { .. } => {
                self.state = State::RequestClosedResponseClosed;
                let mut trailers = HeaderMap::new();
                status
                    .add_header(&mut trailers)
                    .expect("status encodes into trailers");
                Ok(ResponseEnd::Trailers(trailers))
            }
            other @ State::RequestClosedResponseClosed => {
                self.state = other;
                Err(ServerRpcError::AlreadyComplete)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ServerRpcError::InvalidState {
                    operation: "end the response",
                    state,
                })
            }
        }
    }

    /// Mark the start of an inbound read batch; flushes requested while it
    /// runs are coalesced to its end.
    pub fn read_batch_started(&mut self) {
        self.reading_batch = true;
    }

    /// Mark the end of the batch. Returns whether a coalesced flush is due.
    pub fn read_batch_ended(&mut self) -> bool {
        self.reading_batch = false;
        mem::take(&mut self.flush_pending)
    }

    fn request_flush(&mut self, requested: bool) -> bool {
        if requested && self.reading_batch {
            self.flush_pending = true;
            return false;
        }
        requested
    }
}

impl fmt::Debug for ServerRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRpc")
            .field("state", &self.state.name())
            .field("flush_pending", &self.flush_pending)
            .finish()
    }
}

/// Drain the reader for a read event that may carry the end of the stream.
fn finish_read_event(read: &mut ReadState) -> Result<InboundFrames, ServerRpcError> {
    let messages = read.drain()?;

    if read.end_pending {
        if read.reader.is_reading() {
            return Err(ServerRpcError::UnexpectedEndOfStream);
        }
        return Ok(InboundFrames {
            messages,
            end_of_stream: true,
        });
    }

    Ok(InboundFrames {
        messages,
        end_of_stream: false,
    })
}

fn split_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

fn response_parts(status: StatusCode) -> http::response::Parts {
    let (parts, ()) = http::Response::builder()
        .status(status)
        .body(())
        .expect("static response head is valid")
        .into_parts();
    parts
}

fn response_head(write: &WriteConfig, metadata: &HeaderMap) -> http::response::Parts {
    let mut parts = response_parts(StatusCode::OK);
    let headers = &mut parts.headers;

    headers.insert(CONTENT_TYPE, write.content_type.to_header_value());

    if let Some(encoding) = write.response_encoding {
        headers.insert(GRPC_ENCODING_HEADER, encoding.into_header_value());
    }

    if let Some(advertised) = &write.accept_advertisement {
        headers.insert(GRPC_ACCEPT_ENCODING_HEADER, advertised.clone());
    }

    metadata::merge_user_metadata(headers, metadata);
    parts
}

fn trailers_only(status: &Status, content_type: ContentType) -> http::response::Parts {
    let mut parts = response_parts(StatusCode::OK);
    parts
        .headers
        .insert(CONTENT_TYPE, content_type.to_header_value());
    status
        .add_header(&mut parts.headers)
        .expect("status encodes into headers");
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HEADER_SIZE;
    use crate::Code;

    fn registry() -> MethodRegistry {
        let mut methods = MethodRegistry::new();
        methods.register("/echo.Echo/Get");
        methods.register("/echo.Echo/Collect");
        methods
    }

    fn request_head(path: &str, headers: HeaderMap) -> http::request::Parts {
        let (mut parts, ()) = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("http://example.com{path}"))
            .body(())
            .unwrap()
            .into_parts();
        parts.headers = headers;
        parts
    }

    fn grpc_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers
    }

    fn frame(payload: &[u8]) -> Bytes {
        FrameWriter::new(None).encode(payload, false).unwrap()
    }

    fn configured_rpc() -> ServerRpc {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", grpc_headers()), &registry())
            .unwrap();
        assert!(matches!(action, HeadersAction::Configure(_)));
        rpc.handler_configured().unwrap();
        rpc
    }

    #[test]
    fn non_grpc_content_type_is_rejected_with_415() {
        let mut rpc = ServerRpc::new(ServerConfig::new());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", headers), &registry())
            .unwrap();

        match action {
            HeadersAction::Reject(parts) => {
                assert_eq!(parts.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
                assert!(parts.headers.get("grpc-status").is_none());
            }
            other => panic!("expected reject, got {other:?}"),
        }
        assert!(rpc.is_complete());
    }

    #[test]
    fn missing_content_type_is_rejected_with_415() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", HeaderMap::new()), &registry())
            .unwrap();
        assert!(matches!(
            action,
            HeadersAction::Reject(ref parts) if parts.status == StatusCode::UNSUPPORTED_MEDIA_TYPE
        ));
    }

    #[test]
    fn unknown_method_is_trailers_only_unimplemented() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        let action = rpc
            .receive_headers(&request_head("/unknown.Svc/M", grpc_headers()), &registry())
            .unwrap();

        match action {
            HeadersAction::Reject(parts) => {
                assert_eq!(parts.status, StatusCode::OK);
                assert_eq!(
                    parts.headers.get(CONTENT_TYPE).unwrap(),
                    "application/grpc"
                );
                assert_eq!(parts.headers.get("grpc-status").unwrap(), "12");
                let status = Status::from_header_map(&parts.headers).unwrap();
                assert_eq!(status.message(), "'/unknown.Svc/M' is not implemented");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_request_encoding_advertises_alternatives() {
        let config = ServerConfig::new().accept_compressed(CompressionEncoding::Gzip);
        let mut rpc = ServerRpc::new(config);

        let mut headers = grpc_headers();
        headers.insert(GRPC_ENCODING_HEADER, HeaderValue::from_static("br"));
        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", headers), &registry())
            .unwrap();

        match action {
            HeadersAction::Reject(parts) => {
                assert_eq!(parts.status, StatusCode::OK);
                assert_eq!(parts.headers.get("grpc-status").unwrap(), "12");
                assert_eq!(
                    parts.headers.get(GRPC_ACCEPT_ENCODING_HEADER).unwrap(),
                    "gzip"
                );
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_encoding_without_any_enabled_says_so() {
        let mut rpc = ServerRpc::new(ServerConfig::new());

        let mut headers = grpc_headers();
        headers.insert(GRPC_ENCODING_HEADER, HeaderValue::from_static("snappy"));
        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", headers), &registry())
            .unwrap();

        match action {
            HeadersAction::Reject(parts) => {
                let status = Status::from_header_map(&parts.headers).unwrap();
                assert_eq!(status.code(), Code::Unimplemented);
                assert_eq!(status.message(), "compression is not supported");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn configure_carries_routing_and_negotiation() {
        let config = ServerConfig::new()
            .accept_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Gzip);
        let mut rpc = ServerRpc::new(config);

        let mut headers = grpc_headers();
        headers.insert(GRPC_ENCODING_HEADER, HeaderValue::from_static("gzip"));
        headers.insert(
            GRPC_ACCEPT_ENCODING_HEADER,
            HeaderValue::from_static("gzip,deflate"),
        );
        headers.insert("grpc-timeout", HeaderValue::from_static("1M"));

        let action = rpc
            .receive_headers(&request_head("/echo.Echo/Get", headers), &registry())
            .unwrap();

        match action {
            HeadersAction::Configure(context) => {
                assert_eq!(context.path, "/echo.Echo/Get");
                assert_eq!(context.service, "echo.Echo");
                assert_eq!(context.method, "Get");
                assert_eq!(context.request_encoding, CompressionEncoding::Gzip);
                assert_eq!(context.response_encoding, Some(CompressionEncoding::Gzip));
                assert_eq!(
                    context.timeout.unwrap().as_duration(),
                    std::time::Duration::from_secs(60)
                );
            }
            other => panic!("expected configure, got {other:?}"),
        }
    }

    #[test]
    fn data_is_buffered_until_handler_configured() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        rpc.receive_headers(&request_head("/echo.Echo/Get", grpc_headers()), &registry())
            .unwrap();

        let frames = rpc.receive_request_buffer(&frame(b"early")).unwrap();
        assert!(frames.messages.is_empty());

        let frames = rpc.handler_configured().unwrap();
        assert_eq!(frames.messages.len(), 1);
        assert_eq!(&frames.messages[0][..], b"early");
        assert!(!frames.end_of_stream);
    }

    #[test]
    fn end_of_stream_before_configuration_is_remembered() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        rpc.receive_headers(&request_head("/echo.Echo/Get", grpc_headers()), &registry())
            .unwrap();

        rpc.receive_request_buffer(&frame(b"only")).unwrap();
        let frames = rpc.receive_end_of_request_stream().unwrap();
        assert!(frames.messages.is_empty());
        assert!(!frames.end_of_stream);

        let frames = rpc.handler_configured().unwrap();
        assert_eq!(frames.messages.len(), 1);
        assert!(frames.end_of_stream);
    }

    #[test]
    fn end_of_stream_mid_message_is_an_error() {
        let mut rpc = configured_rpc();
        let partial = &frame(b"cut short")[..4];
        rpc.receive_request_buffer(partial).unwrap();
        let err = rpc.receive_end_of_request_stream().unwrap_err();
        assert!(matches!(err, ServerRpcError::UnexpectedEndOfStream));
    }

    #[test]
    fn inbound_data_after_failure_is_ignored() {
        let mut rpc = configured_rpc();

        // 42 is not a valid compression flag.
        let err = rpc.receive_request_buffer(&[42]).unwrap_err();
        assert!(matches!(
            err,
            ServerRpcError::Codec(CodecError::InvalidCompressionFlag(42))
        ));

        let frames = rpc.receive_request_buffer(&frame(b"late")).unwrap();
        assert!(frames.messages.is_empty());
    }

    #[test]
    fn response_head_echoes_content_type_and_encoding() {
        let config = ServerConfig::new().send_compressed(CompressionEncoding::Gzip);
        let mut rpc = ServerRpc::new(config);

        let mut headers = grpc_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc+proto"));
        headers.insert(GRPC_ACCEPT_ENCODING_HEADER, HeaderValue::from_static("gzip"));
        rpc.receive_headers(&request_head("/echo.Echo/Get", headers), &registry())
            .unwrap();
        rpc.handler_configured().unwrap();

        let mut metadata = HeaderMap::new();
        metadata.insert("x-shard", HeaderValue::from_static("7"));
        let head = rpc.send_metadata(&metadata).unwrap();

        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.get(CONTENT_TYPE).unwrap(), "application/grpc");
        assert_eq!(head.headers.get(GRPC_ENCODING_HEADER).unwrap(), "gzip");
        assert_eq!(head.headers.get("x-shard").unwrap(), "7");
    }

    #[test]
    fn send_metadata_twice_is_invalid() {
        let mut rpc = configured_rpc();
        rpc.send_metadata(&HeaderMap::new()).unwrap();
        let err = rpc.send_metadata(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ServerRpcError::InvalidState { .. }));
    }

    #[test]
    fn first_message_without_metadata_synthesizes_headers() {
        let mut rpc = configured_rpc();

        let action = rpc
            .send_message(b"HELLO", MessageOptions { compress: false, flush: true })
            .unwrap();

        let head = action.headers.expect("implicit response head");
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(&action.body[HEADER_SIZE..], b"HELLO");
        assert!(action.flush);

        let action = rpc
            .send_message(b"AGAIN", MessageOptions { compress: false, flush: false })
            .unwrap();
        assert!(action.headers.is_none());
    }

    #[test]
    fn trailers_after_messages() {
        let mut rpc = configured_rpc();
        rpc.send_message(b"HELLO", MessageOptions { compress: false, flush: false })
            .unwrap();

        let end = rpc.send_end(&Status::ok("")).unwrap();
        match end {
            ResponseEnd::Trailers(trailers) => {
                assert_eq!(trailers.get("grpc-status").unwrap(), "0");
            }
            other => panic!("expected trailers, got {other:?}"),
        }
        assert!(rpc.is_complete());
    }

    #[test]
    fn end_before_headers_is_trailers_only() {
        let mut rpc = configured_rpc();

        let end = rpc
            .send_end(&Status::not_found("no such thing"))
            .unwrap();
        match end {
            ResponseEnd::TrailersOnly(parts) => {
                assert_eq!(parts.status, StatusCode::OK);
                assert_eq!(parts.headers.get(CONTENT_TYPE).unwrap(), "application/grpc");
                assert_eq!(parts.headers.get("grpc-status").unwrap(), "5");
            }
            other => panic!("expected trailers-only, got {other:?}"),
        }
    }

    #[test]
    fn send_after_end_is_already_complete() {
        let mut rpc = configured_rpc();
        rpc.send_end(&Status::ok("")).unwrap();

        let err = rpc
            .send_message(b"late", MessageOptions { compress: false, flush: false })
            .unwrap_err();
        assert!(matches!(err, ServerRpcError::AlreadyComplete));

        let err = rpc.send_end(&Status::ok("")).unwrap_err();
        assert!(matches!(err, ServerRpcError::AlreadyComplete));
    }

    #[test]
    fn flushes_are_coalesced_during_read_batches() {
        let mut rpc = configured_rpc();

        rpc.read_batch_started();
        let action = rpc
            .send_message(b"a", MessageOptions { compress: false, flush: true })
            .unwrap();
        assert!(!action.flush);
        let action = rpc
            .send_message(b"b", MessageOptions { compress: false, flush: true })
            .unwrap();
        assert!(!action.flush);
        assert!(rpc.read_batch_ended());

        // Outside a batch the flush passes through.
        let action = rpc
            .send_message(b"c", MessageOptions { compress: false, flush: true })
            .unwrap();
        assert!(action.flush);
        assert!(!rpc.read_batch_ended());
    }

    #[test]
    fn compressed_request_messages_are_inflated() {
        let config = ServerConfig::new().accept_compressed(CompressionEncoding::Gzip);
        let mut rpc = ServerRpc::new(config);

        let mut headers = grpc_headers();
        headers.insert(GRPC_ENCODING_HEADER, HeaderValue::from_static("gzip"));
        rpc.receive_headers(&request_head("/echo.Echo/Collect", headers), &registry())
            .unwrap();
        rpc.handler_configured().unwrap();

        let payload = b"request payload ".repeat(32);
        let wire = FrameWriter::new(Some(CompressionEncoding::Gzip))
            .encode(&payload, true)
            .unwrap();

        let frames = rpc.receive_request_buffer(&wire).unwrap();
        assert_eq!(&frames.messages[0][..], &payload[..]);
    }

    #[test]
    fn malformed_path_is_unimplemented() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        let action = rpc
            .receive_headers(&request_head("/notamethod", grpc_headers()), &registry())
            .unwrap();
        match action {
            HeadersAction::Reject(parts) => {
                assert_eq!(parts.headers.get("grpc-status").unwrap(), "12");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn headers_twice_is_invalid_state() {
        let mut rpc = ServerRpc::new(ServerConfig::new());
        rpc.receive_headers(&request_head("/echo.Echo/Get", grpc_headers()), &registry())
            .unwrap();
        let err = rpc
            .receive_headers(&request_head("/echo.Echo/Get", grpc_headers()), &registry())
            .unwrap_err();
        assert!(matches!(err, ServerRpcError::InvalidState { .. }));
    }
}
