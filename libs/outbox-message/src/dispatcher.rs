//! The contract a relay hands a batch of messages to once they're due for
//! delivery (spec C7/C9). Lives here rather than alongside any one relay so
//! that both `transactional-outbox`'s [`OutboxRelay`] and `amqp-transport`'s
//! AMQP dispatcher can depend on a single shared trait without either of
//! those crates depending on the other.
//!
//! [`OutboxRelay`]: https://docs.rs/transactional-outbox

use crate::message::Message;
use async_trait::async_trait;
use thiserror::Error;

/// A dispatch attempt failed. Carries no `source` — dispatchers (AMQP,
/// or an in-memory test double) already log the underlying cause; callers
/// only need to know the batch did not go out.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DispatchError(pub String);

impl DispatchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Sends a run of messages to whatever sits downstream of the outbox.
/// Implementations own their own retry policy; a returned `Err` means the
/// run is considered wholly undelivered and the caller must not mark it
/// consumed.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, messages: &[Message]) -> Result<(), DispatchError>;
}
