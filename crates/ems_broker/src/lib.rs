//! ems_broker
//!
//! The broker crate contains the message engine: topics fanning out to
//! channels, the per-channel in-flight/deferred redelivery machinery,
//! the sampled queue scanner, and the engine root that owns the topic
//! registry, metadata persistence and node health.
//!
//! Transport crates (TCP protocol, HTTP surface) sit on top of this
//! crate and translate wire commands into the operations exposed here.

pub mod channel;
pub mod client;
pub mod engine;
pub mod error;
pub mod message;
pub mod pqueue;
pub mod quantile;
pub mod scanner;
pub mod stats;
pub mod topic;

pub use channel::Channel;
pub use client::{ClientConn, ClientId, ClientState, OutFrame};
pub use engine::{Context, Engine, Notification};
pub use error::EngineError;
pub use message::{IdFactory, Message, MessageId, MSG_ID_LENGTH, MSG_MIN_SIZE};
pub use topic::Topic;

#[cfg(test)]
mod tests;
