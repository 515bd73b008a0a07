//! Error types for the AMQP transport.

use thiserror::Error;

pub type AmqpResult<T> = Result<T, AmqpError>;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel lease timed out")]
    Timeout,

    #[error("channel pool is closed")]
    PoolClosed,

    #[error("channel was not leased by this pool")]
    ChannelNotLeased,

    #[error("unable to connect to any configured broker URL: {0}")]
    AllUrlsFailed(String),

    #[error("unable to dispatch messages after retrying: {0}")]
    UnableToDispatchMessages(String),
}
