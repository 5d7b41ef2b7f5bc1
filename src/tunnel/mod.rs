//! Master<->slave tunnel fabric.
//!
//! Two halves:
//!
//! - **Master** ([`manager`]): accepts slave control connections at
//!   `/cluster/tunnel`, runs the auth handshake, and exposes HTTP forwarding
//!   and WebSocket tunnel creation to the gateway layer. State lives in the
//!   [`registry`] (connected slaves), [`correlator`] (in-flight HTTP
//!   requests) and [`mux`] (open WebSocket tunnels).
//! - **Slave** ([`client`]): dials the master, authenticates, and serves
//!   forwarded traffic by calling the local service over plain HTTP/WS.
//!   Reconnects forever with capped exponential backoff.

use crate::protocol::Frame;

pub mod client;
pub mod correlator;
pub mod manager;
pub mod mux;
pub mod registry;

/// Close codes used on the `/cluster/tunnel` control connection.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
pub const CLOSE_AUTH_FAILED: u16 = 4002;
pub const CLOSE_EXPECTED_AUTH: u16 = 4003;
pub const CLOSE_REPLACED: u16 = 4004;

/// A message for a control connection's writer task. Frames from multiple
/// producers are funneled through one channel so bytes of distinct JSON
/// messages never interleave on the socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: &'static str },
}
