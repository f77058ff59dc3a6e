//! Connection-scoped machinery.
//!
//! A gRPC connection is more than its streams: it tracks SETTINGS receipt,
//! counts stream opens and closes, idles itself away when unused, quiesces
//! gracefully on GOAWAY, and defends its keepalive budget. The state
//! machines here are sans-io like the per-RPC ones; only the
//! [`ConnectionManager`] is async, because reconnection is inherently about
//! timers and racing futures.

pub mod channel;
pub mod conn;
pub mod idle;
pub mod keepalive;

pub use channel::{
    ConnectionBackoff, ConnectionHandle, ConnectionManager, ConnectivityState, ManagerHandle,
    Retries,
};
pub use conn::{ConnActions, ConnFrame, ConnectionDriver, ConnectionEvent};
pub use idle::{IdleStateMachine, ManagerEvent, Operations, Role};
pub use keepalive::{KeepaliveConfig, PingHandler};
