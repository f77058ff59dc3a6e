//! Core gRPC-over-HTTP/2 protocol engine.
//!
//! This crate implements the protocol heart of a gRPC client and server:
//! the per-RPC state machines, the length-prefixed message framing codec
//! with optional per-message compression, the per-connection
//! idle/quiescing state machine, the keepalive ping engine, and a client
//! channel manager with exponential-backoff reconnection.
//!
//! It deliberately does **not** implement the HTTP/2 frame layer, TLS, or
//! message serialization. The state machines consume already-framed HTTP/2
//! events (headers, data, settings, ping, goaway) and produce the frames
//! and timer operations the caller should perform, which keeps every state
//! machine synchronous and testable without sockets.
//!
//! # Layout
//!
//! - [`codec`]: the `[flag | u32 length | payload]` framing reader/writer
//!   and the compression algorithms (`identity`, `gzip`, `deflate`).
//! - [`client`]: the client-side per-RPC state machine.
//! - [`server`]: the server-side per-RPC state machine and the gRPC-Web
//!   adapter.
//! - [`transport`]: connection-scoped machinery: idle/quiescing tracking,
//!   keepalive pings, and the reconnecting [`transport::ConnectionManager`].
//! - [`Status`] / [`Code`]: the gRPC status taxonomy, including the
//!   HTTP-to-gRPC status mapping.
//! - [`Timeout`]: the `grpc-timeout` wire format with unit promotion.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod client;
pub mod codec;
pub mod metadata;
pub mod server;
pub mod transport;

mod status;
mod timeout;

pub use status::{Code, Status};
pub use timeout::{InvalidTimeout, Timeout, TimeoutUnit};

/// A type-erased error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
