//! # lib_net
//!
//! A unified client/server networking library: HTTP/1.1, WebSocket and SOCKS5
//! over TCP with optional TLS, HTTP Basic/Digest authentication (issuer and
//! validator) and transparent proxy traversal (HTTP CONNECT and SOCKS5) for
//! outbound connections.
//!
//! ## Module Map:
//! - **`core`**: the reactor (timers, watches, wake queue), per-connection
//!   broker, transport (plain/TLS), byte-chunk buffers, partners map.
//! - **`socks5`**: client and server SOCKS5 state machines plus the wire codec.
//! - **`http`**: HTTP/1.1 message codec and the CONNECT tunnel state machine.
//! - **`auth`**: Basic and Digest authentication, both halves.
//! - **`ws`**: WebSocket handshake validation and the frame codec.
//! - **`client`**: the outbound pipeline (resolve, connect, proxy traversal,
//!   application drivers, retry and keepalive).
//! - **`server`**: accept loop, admission filtering, HTTP/WS server drivers
//!   and the CONNECT/SOCKS5 proxy servers.
//! - **`loggers`**, **`configs`**, **`utils`**: support modules for the
//!   bundled binaries.

// Declare the modules to re-export
pub mod core;
pub mod errors;
pub mod socks5;
pub mod http;
pub mod auth;
pub mod ws;
pub mod utils;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "configs")]
pub mod configs;

// Re-export the types a typical application touches
pub use crate::core::broker::{Broker, BrokerId, Phase, Role};
pub use crate::core::reactor::Reactor;
pub use errors::{ErrorKind, NetError};
