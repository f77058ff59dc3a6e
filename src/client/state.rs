use std::{error::Error, fmt, mem};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri, Version};
use tracing::trace;

use super::{CallConfig, StreamArity};
use crate::{
    codec::{CodecError, CompressionEncoding, FrameReader, FrameWriter},
    metadata::{
        self, GRPC_ACCEPT_ENCODING_HEADER, GRPC_ENCODING_HEADER, GRPC_TIMEOUT_HEADER,
        DEFAULT_USER_AGENT, GRPC_CONTENT_TYPE, TE_TRAILERS,
    },
    timeout::TimeoutExpired,
    Code, Status, Timeout,
};

/// The client half of one RPC, as a state machine.
///
/// The caller wires it to an HTTP/2 stream: operations either produce bytes
/// and header blocks to write, or consume the peer's frames. The machine is
/// strict about ordering; events arriving in a state that cannot accept them
/// return [`ClientRpcError`], which converts into the [`Status`] the caller
/// should surface.
pub struct ClientRpc {
    state: State,
}

enum State {
    ClientIdleServerIdle {
        config: Box<CallConfig>,
    },
    ClientActiveServerIdle {
        send: SendState,
        recv: RecvConfig,
    },
    ClientClosedServerIdle {
        recv: RecvConfig,
    },
    ClientActiveServerActive {
        send: SendState,
        recv: RecvState,
    },
    ClientClosedServerActive {
        recv: RecvState,
    },
    ClientClosedServerClosed,
    /// Placeholder installed while a transition moves substate out of the
    /// enum. Never observable: every operation puts a real state back before
    /// it returns.
    Modifying,
}

struct SendState {
    writer: FrameWriter,
    arity: StreamArity,
    sent_message: bool,
}

struct RecvConfig {
    arity: StreamArity,
    accept: crate::codec::EnabledCompressionEncodings,
    decompression_limit: usize,
}

struct RecvState {
    reader: FrameReader,
    arity: StreamArity,
    seen_message: bool,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::ClientIdleServerIdle { .. } => "client idle, server idle",
            State::ClientActiveServerIdle { .. } => "client active, server idle",
            State::ClientClosedServerIdle { .. } => "client closed, server idle",
            State::ClientActiveServerActive { .. } => "client active, server active",
            State::ClientClosedServerActive { .. } => "client closed, server active",
            State::ClientClosedServerClosed => "client closed, server closed",
            State::Modifying => unreachable!("modifying state must never be observed"),
        }
    }
}

/// Errors raised by [`ClientRpc`] operations.
#[derive(Debug)]
pub enum ClientRpcError {
    /// The operation is not valid in the machine's current state.
    InvalidState {
        /// The rejected operation, for diagnostics.
        operation: &'static str,
        /// The state that rejected it.
        state: &'static str,
    },
    /// The request stream was closed already.
    AlreadyClosed,
    /// A second message on a single-message stream direction.
    CardinalityViolation,
    /// The response `:status` was not 200 and no gRPC status was present.
    InvalidHttpStatus(StatusCode),
    /// The response `content-type` is not a gRPC one.
    InvalidContentType(Option<String>),
    /// The response `grpc-encoding` names an algorithm outside the client's
    /// supported set.
    UnsupportedMessageEncoding(String),
    /// Deframing the response body failed.
    Codec(CodecError),
}

impl fmt::Display for ClientRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRpcError::InvalidState { operation, state } => {
                write!(f, "cannot {operation} while {state}")
            }
            ClientRpcError::AlreadyClosed => write!(f, "request stream is already closed"),
            ClientRpcError::CardinalityViolation => {
                write!(f, "stream cardinality violation: message on a completed stream")
            }
            ClientRpcError::InvalidHttpStatus(status) => {
                write!(f, "non-200 HTTP response status: {status}")
            }
            ClientRpcError::InvalidContentType(found) => match found {
                Some(found) => write!(f, "invalid content-type {found:?}"),
                None => write!(f, "missing content-type"),
            },
            ClientRpcError::UnsupportedMessageEncoding(token) => {
                write!(f, "unsupported-message-encoding({token})")
            }
            ClientRpcError::Codec(err) => err.fmt(f),
        }
    }
}

impl Error for ClientRpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientRpcError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for ClientRpcError {
    fn from(err: CodecError) -> Self {
        ClientRpcError::Codec(err)
    }
}

impl From<ClientRpcError> for Status {
    fn from(err: ClientRpcError) -> Status {
        match err {
            ClientRpcError::InvalidState { .. } | ClientRpcError::CardinalityViolation => {
                Status::internal(err.to_string())
            }
            ClientRpcError::AlreadyClosed => Status::unavailable(err.to_string()),
            ClientRpcError::InvalidHttpStatus(status) => {
                Status::new(Code::from_http(status), err.to_string())
            }
            ClientRpcError::InvalidContentType(_) => Status::internal(err.to_string()),
            ClientRpcError::UnsupportedMessageEncoding(_) => Status::internal(err.to_string()),
            ClientRpcError::Codec(codec) => codec.into(),
        }
    }
}

impl ClientRpc {
    /// Create the machine for one call. Nothing is emitted until
    /// [`send_request_headers`](ClientRpc::send_request_headers).
    pub fn new(config: CallConfig) -> Self {
        ClientRpc {
            state: State::ClientIdleServerIdle {
                config: Box::new(config),
            },
        }
    }

    /// Whether the RPC has fully terminated.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::ClientClosedServerClosed)
    }

    /// Open the RPC: build the request header block to put on the wire.
    ///
    /// Valid only before anything else happened.
    pub fn send_request_headers(&mut self) -> Result<http::request::Parts, ClientRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::ClientIdleServerIdle { config } => {
                let parts = build_request_head(&config);
                self.state = State::ClientActiveServerIdle {
                    send: SendState {
                        writer: FrameWriter::new(config.send_compression),
                        arity: config.request_arity,
                        sent_message: false,
                    },
                    recv: RecvConfig {
                        arity: config.response_arity,
                        accept: config.accept_compression,
                        decompression_limit: config.max_decoding_message_size,
                    },
                };
                Ok(parts)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ClientRpcError::InvalidState {
                    operation: "send request headers",
                    state,
                })
            }
        }
    }

    /// Frame one request message for the wire.
    pub fn send_request(
        &mut self,
        payload: &[u8],
        compressed: bool,
    ) -> Result<Bytes, ClientRpcError> {
        match &mut self.state {
            State::ClientActiveServerIdle { send, .. }
            | State::ClientActiveServerActive { send, .. } => {
                if send.arity == StreamArity::One && send.sent_message {
                    return Err(ClientRpcError::CardinalityViolation);
                }
                let frame = send.writer.encode(payload, compressed)?;
                send.sent_message = true;
                Ok(frame)
            }
            State::ClientClosedServerIdle { .. }
            | State::ClientClosedServerActive { .. }
            | State::ClientClosedServerClosed => Err(ClientRpcError::CardinalityViolation),
            state @ State::ClientIdleServerIdle { .. } => Err(ClientRpcError::InvalidState {
                operation: "send a request message",
                state: state.name(),
            }),
            State::Modifying => unreachable!("modifying state must never be observed"),
        }
    }

    /// Half-close: no more request messages will be sent. Produces no bytes;
    /// the caller ends the HTTP/2 stream.
    pub fn send_end_of_request_stream(&mut self) -> Result<(), ClientRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::ClientActiveServerIdle { recv, .. } => {
                self.state = State::ClientClosedServerIdle { recv };
                Ok(())
            }
            State::ClientActiveServerActive { recv, .. } => {
                self.state = State::ClientClosedServerActive { recv };
                Ok(())
            }
            other @ (State::ClientClosedServerIdle { .. }
            | State::ClientClosedServerActive { .. }
            | State::ClientClosedServerClosed) => {
                self.state = other;
                Err(ClientRpcError::AlreadyClosed)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ClientRpcError::InvalidState {
                    operation: "close the request stream",
                    state,
                })
            }
        }
    }

    /// Process the response header block.
    ///
    /// Returns `Ok(Some(status))` for a trailers-only response: the header
    /// block itself carried `grpc-status` and the RPC is complete. Returns
    /// `Ok(None)` when the response body follows. Validation failures
    /// terminate the RPC and convert into the `Status` to surface.
    pub fn receive_response_headers(
        &mut self,
        head: &http::response::Parts,
    ) -> Result<Option<Status>, ClientRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::ClientActiveServerIdle { send, recv } => {
                match self.validate_response_head(head, recv) {
                    Ok(ResponseHead::TrailersOnly(status)) => {
                        self.state = State::ClientClosedServerClosed;
                        Ok(Some(status))
                    }
                    Ok(ResponseHead::Streaming(recv)) => {
                        self.state = State::ClientActiveServerActive { send, recv };
                        Ok(None)
                    }
                    Err(err) => {
                        self.state = State::ClientClosedServerClosed;
                        Err(err)
                    }
                }
            }
            State::ClientClosedServerIdle { recv } => {
                match self.validate_response_head(head, recv) {
                    Ok(ResponseHead::TrailersOnly(status)) => {
                        self.state = State::ClientClosedServerClosed;
                        Ok(Some(status))
                    }
                    Ok(ResponseHead::Streaming(recv)) => {
                        self.state = State::ClientClosedServerActive { recv };
                        Ok(None)
                    }
                    Err(err) => {
                        self.state = State::ClientClosedServerClosed;
                        Err(err)
                    }
                }
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ClientRpcError::InvalidState {
                    operation: "receive response headers",
                    state,
                })
            }
        }
    }

    fn validate_response_head(
        &self,
        head: &http::response::Parts,
        recv: RecvConfig,
    ) -> Result<ResponseHead, ClientRpcError> {
        // Trailers-only first: a header block carrying `grpc-status` is the
        // whole response, regardless of the HTTP status around it.
        if let Some(status) = Status::from_header_map(&head.headers) {
            return Ok(ResponseHead::TrailersOnly(status));
        }

        if head.status != StatusCode::OK {
            return Err(ClientRpcError::InvalidHttpStatus(head.status));
        }

        match head.headers.get(CONTENT_TYPE) {
            Some(value) if metadata::is_grpc_response_content_type(value) => {}
            found => {
                return Err(ClientRpcError::InvalidContentType(
                    found.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
                ));
            }
        }

        let decompressor = match head.headers.get(GRPC_ENCODING_HEADER) {
            None => None,
            Some(value) => {
                let token = value.to_str().unwrap_or("");
                match CompressionEncoding::from_header_token(token) {
                    Some(encoding) if recv.accept.is_enabled(encoding) => Some(encoding),
                    _ => {
                        return Err(ClientRpcError::UnsupportedMessageEncoding(
                            token.to_string(),
                        ));
                    }
                }
            }
        };

        Ok(ResponseHead::Streaming(RecvState {
            reader: FrameReader::new(decompressor, recv.decompression_limit),
            arity: recv.arity,
            seen_message: false,
        }))
    }

    /// Feed response body bytes; returns the complete messages they yielded.
    ///
    /// A framing or cardinality failure terminates the RPC.
    pub fn receive_response_buffer(
        &mut self,
        data: &[u8],
        max_length: usize,
    ) -> Result<Vec<Bytes>, ClientRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::ClientActiveServerActive { send, mut recv } => {
                match drain_messages(&mut recv, data, max_length) {
                    Ok(messages) => {
                        self.state = State::ClientActiveServerActive { send, recv };
                        Ok(messages)
                    }
                    Err(err) => {
                        self.state = State::ClientClosedServerClosed;
                        Err(err)
                    }
                }
            }
            State::ClientClosedServerActive { mut recv } => {
                match drain_messages(&mut recv, data, max_length) {
                    Ok(messages) => {
                        self.state = State::ClientClosedServerActive { recv };
                        Ok(messages)
                    }
                    Err(err) => {
                        self.state = State::ClientClosedServerClosed;
                        Err(err)
                    }
                }
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ClientRpcError::InvalidState {
                    operation: "receive response data",
                    state,
                })
            }
        }
    }

    /// Process the trailers block; yields the RPC's final [`Status`].
    pub fn receive_end_of_response_stream(
        &mut self,
        trailers: &HeaderMap,
    ) -> Result<Status, ClientRpcError> {
        match mem::replace(&mut self.state, State::Modifying) {
            State::ClientActiveServerIdle { .. }
            | State::ClientActiveServerActive { .. }
            | State::ClientClosedServerIdle { .. }
            | State::ClientClosedServerActive { .. } => {
                self.state = State::ClientClosedServerClosed;
                Ok(status_from_trailers(trailers))
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(ClientRpcError::InvalidState {
                    operation: "receive trailers",
                    state,
                })
            }
        }
    }

    /// A DATA frame arrived with END_STREAM set: the server ended the stream
    /// without trailers, which is a protocol violation.
    ///
    /// Returns the synthesized status, or `None` when the RPC was already
    /// complete and the event is ignored.
    pub fn receive_end_stream_on_data(&mut self) -> Option<Status> {
        if matches!(
            self.state,
            State::ClientClosedServerClosed | State::ClientIdleServerIdle { .. }
        ) {
            return None;
        }
        self.state = State::ClientClosedServerClosed;
        Some(Status::internal(
            "Protocol violation: received DATA frame with end stream set",
        ))
    }

    /// Cancel the RPC locally.
    ///
    /// Returns the status to surface, or `None` when the RPC already
    /// completed and there is nothing to cancel.
    pub fn cancel(&mut self) -> Option<Status> {
        if self.is_complete() {
            return None;
        }
        trace!("cancelling rpc");
        self.state = State::ClientClosedServerClosed;
        Some(Status::cancelled("RPC cancelled by the client"))
    }

    /// The local deadline timer fired.
    ///
    /// Returns the status to surface, or `None` when the RPC already
    /// completed.
    pub fn deadline_expired(&mut self, timeout: Timeout) -> Option<Status> {
        if self.is_complete() {
            return None;
        }
        self.state = State::ClientClosedServerClosed;
        Some(Status::deadline_exceeded(
            TimeoutExpired(timeout).to_string(),
        ))
    }

    /// The connection under this RPC went away before it completed.
    ///
    /// Returns the `unavailable` status to surface, or `None` when the RPC
    /// already completed.
    pub fn connection_closed(&mut self) -> Option<Status> {
        if self.is_complete() {
            return None;
        }
        self.state = State::ClientClosedServerClosed;
        Some(Status::unavailable(
            "connection closed before the RPC completed",
        ))
    }
}

enum ResponseHead {
    TrailersOnly(Status),
    Streaming(RecvState),
}

fn drain_messages(
    recv: &mut RecvState,
    data: &[u8],
    max_length: usize,
) -> Result<Vec<Bytes>, ClientRpcError> {
    recv.reader.append(data);

    let mut messages = Vec::new();
    while let Some(message) = recv.reader.next_message(max_length)? {
        if recv.arity == StreamArity::One && recv.seen_message {
            return Err(ClientRpcError::CardinalityViolation);
        }
        recv.seen_message = true;
        messages.push(message);
    }
    Ok(messages)
}

impl fmt::Debug for ClientRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRpc")
            .field("state", &self.state.name())
            .finish()
    }
}

/// Parse a trailers block into the RPC's final status.
///
/// A missing or unparseable `grpc-status` defaults to `Unknown`.
fn status_from_trailers(trailers: &HeaderMap) -> Status {
    match Status::from_header_map(trailers) {
        Some(status) => status,
        None => {
            trace!("trailers missing grpc-status");
            Status::with_metadata(Code::Unknown, "", trailers.clone())
        }
    }
}

fn build_request_head(config: &CallConfig) -> http::request::Parts {
    let uri = Uri::builder()
        .scheme(config.scheme.as_str())
        .authority(config.authority.as_str())
        .path_and_query(config.path.as_str())
        .build()
        .expect("scheme, authority and path form a valid URI");

    let method = if config.cacheable {
        Method::GET
    } else {
        Method::POST
    };

    let (mut parts, ()) = http::Request::builder()
        .method(method)
        .uri(uri)
        .version(Version::HTTP_2)
        .body(())
        .expect("request head is valid")
        .into_parts();

    let headers = &mut parts.headers;
    headers.insert(CONTENT_TYPE, GRPC_CONTENT_TYPE);
    headers.insert(http::header::TE, TE_TRAILERS);
    headers.insert(
        http::header::USER_AGENT,
        config
            .user_agent
            .clone()
            .unwrap_or_else(|| http::HeaderValue::from_static(DEFAULT_USER_AGENT)),
    );

    if let Some(encoding) = config.send_compression {
        headers.insert(GRPC_ENCODING_HEADER, encoding.into_header_value());
    }

    if let Some(accept) = config
        .accept_compression
        .into_accept_encoding_header_value()
    {
        headers.insert(GRPC_ACCEPT_ENCODING_HEADER, accept);
    }

    if let Some(timeout) = config.timeout.to_header_value() {
        headers.insert(GRPC_TIMEOUT_HEADER, timeout);
    }

    metadata::merge_user_metadata(headers, &config.metadata);

    parts
}
