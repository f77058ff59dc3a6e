//! Client-side per-RPC protocol state.
//!
//! [`ClientRpc`] is the state machine behind one outbound call: it builds the
//! request header block, frames outbound messages, validates the response
//! head, deframes inbound messages and synthesizes the final [`Status`] from
//! trailers. It is sans-io; the HTTP/2 layer feeds it events and writes out
//! whatever it returns.
//!
//! [`Status`]: crate::Status

mod state;

pub use state::{ClientRpc, ClientRpcError};

use http::{uri::PathAndQuery, HeaderMap, HeaderValue};

use crate::{
    codec::{CompressionEncoding, EnabledCompressionEncodings, DEFAULT_MAX_MESSAGE_SIZE},
    Timeout,
};

/// How many messages a stream direction carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamArity {
    /// Exactly one message; a second is a cardinality violation.
    One,
    /// Any number of messages.
    Many,
}

/// The URI scheme of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plaintext.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Configuration for a single call.
///
/// ```rust
/// use grpcore::client::CallConfig;
/// use grpcore::codec::CompressionEncoding;
///
/// let config = CallConfig::new(
///         "/echo.Echo/Get".parse().unwrap(),
///         "example.com",
///     )
///     .send_compressed(CompressionEncoding::Gzip)
///     .accept_compressed(CompressionEncoding::Gzip)
///     .max_decoding_message_size(2 * 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub(crate) path: PathAndQuery,
    pub(crate) authority: String,
    pub(crate) scheme: Scheme,
    pub(crate) cacheable: bool,
    pub(crate) timeout: Timeout,
    pub(crate) user_agent: Option<HeaderValue>,
    pub(crate) request_arity: StreamArity,
    pub(crate) response_arity: StreamArity,
    pub(crate) send_compression: Option<CompressionEncoding>,
    pub(crate) accept_compression: EnabledCompressionEncodings,
    pub(crate) max_decoding_message_size: usize,
    pub(crate) metadata: HeaderMap,
}

impl CallConfig {
    /// A unary call to `path` on `authority`, plaintext, without deadline or
    /// compression.
    pub fn new(path: PathAndQuery, authority: impl Into<String>) -> Self {
        CallConfig {
            path,
            authority: authority.into(),
            scheme: Scheme::Http,
            cacheable: false,
            timeout: Timeout::INFINITE,
            user_agent: None,
            request_arity: StreamArity::One,
            response_arity: StreamArity::One,
            send_compression: None,
            accept_compression: EnabledCompressionEncodings::default(),
            max_decoding_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            metadata: HeaderMap::new(),
        }
    }

    /// Set the URI scheme.
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Mark the call cacheable; it is sent as a `GET`.
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Set the deadline transmitted as `grpc-timeout`.
    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the `user-agent` header.
    pub fn user_agent(mut self, user_agent: HeaderValue) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    /// Set the request and response stream arities.
    pub fn arities(mut self, request: StreamArity, response: StreamArity) -> Self {
        self.request_arity = request;
        self.response_arity = response;
        self
    }

    /// Compress requests with the provided encoding.
    ///
    /// Requires the server to accept the specified encoding, otherwise it
    /// might return an error.
    pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compression = Some(encoding);
        self
    }

    /// Enable accepting compressed responses.
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.accept_compression.enable(encoding);
        self
    }

    /// Limits the maximum size of a decoded message.
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = limit;
        self
    }

    /// Attach custom metadata sent with the request headers.
    pub fn metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }
}
