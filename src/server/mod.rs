//! Server-side per-RPC protocol state.
//!
//! [`ServerRpc`] drives one inbound HTTP/2 stream through the gRPC protocol:
//! it validates the request head, routes the `/service/method` path against a
//! [`MethodRegistry`], negotiates compression, buffers the request body until
//! the service handler is configured, and frames the response including
//! trailers-only replies. [`web`] adapts the same machinery to gRPC-Web
//! peers.

mod state;
pub mod web;

pub use state::{
    HeadersAction, InboundFrames, MessageOptions, ResponseEnd, RpcContext, SendAction, ServerRpc,
    ServerRpcError,
};

use std::collections::HashSet;

use crate::codec::{CompressionEncoding, EnabledCompressionEncodings, DEFAULT_MAX_MESSAGE_SIZE};

/// The set of `/service/method` paths a server implements.
#[derive(Debug, Default, Clone)]
pub struct MethodRegistry {
    paths: HashSet<String>,
}

impl MethodRegistry {
    /// An empty registry; every RPC is unimplemented.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method by its full path, e.g. `/echo.Echo/Get`.
    pub fn register(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    /// Whether the exact path is implemented.
    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}

/// Per-connection server configuration shared by its RPCs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) accept_compression: EnabledCompressionEncodings,
    pub(crate) send_compression: EnabledCompressionEncodings,
    pub(crate) max_decoding_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            accept_compression: EnabledCompressionEncodings::default(),
            send_compression: EnabledCompressionEncodings::default(),
            max_decoding_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with no compression and the default message
    /// size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable accepting compressed requests.
    ///
    /// If a request with an unsupported encoding is received the server will
    /// respond with a trailers-only `unimplemented`.
    pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.accept_compression.enable(encoding);
        self
    }

    /// Enable sending compressed responses.
    ///
    /// A response is compressed only when the client advertised the encoding
    /// in `grpc-accept-encoding`.
    pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
        self.send_compression.enable(encoding);
        self
    }

    /// Limits the maximum size of a decoded message.
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.max_decoding_message_size = limit;
        self
    }
}
