use ems_persistence::QueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("exiting")]
    Exiting,
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("message already in flight")]
    AlreadyInFlight,
    #[error("message not in flight")]
    MessageNotInFlight,
    #[error("channel consumer limit reached")]
    TooManyConsumers,
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("topic not found")]
    TopicNotFound,
    #[error("channel not found")]
    ChannelNotFound,
    #[error(transparent)]
    Queue(#[from] QueueError),
}
