//! ems_client
//!
//! A deliberately small client for the broker's V2 TCP protocol, used
//! by the `emsd client` smoke subcommand and the end-to-end tests. It
//! speaks the full command set but implements no connection pooling,
//! backoff or discovery.

pub mod conn;

pub use conn::{Client, ConsumedMessage, Frame, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE};
