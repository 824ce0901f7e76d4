//! ems_transport
//!
//! Network surfaces of the broker: the V2 TCP protocol state machine
//! serving consumers and producers, the thin HTTP admin/publish
//! surface, the lookup directory peer loop, and the HTTP auth client.

pub mod auth;
pub mod error;
pub mod frame;
pub mod http;
pub mod lookup;
pub mod message;
pub mod protocol;
pub mod tcp;

pub use error::ProtocolError;
pub use tcp::run_tcp_server;

#[cfg(test)]
mod tests;
