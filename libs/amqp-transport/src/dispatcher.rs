//! Publishes a relay's batches to AMQP (spec C9, the push side of the
//! outbox-message [`Dispatcher`] seam).

use crate::channel_pool::ChannelPool;
use crate::error::AmqpError;
use futures_util::future::try_join_all;
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use outbox_message::{DispatchError, Dispatcher, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Picks the exchange or routing key a message publishes under.
#[derive(Clone)]
pub enum Resolver {
    Static(String),
    PerMessage(Arc<dyn Fn(&Message) -> String + Send + Sync>),
}

impl Resolver {
    fn resolve(&self, message: &Message) -> String {
        match self {
            Resolver::Static(s) => s.clone(),
            Resolver::PerMessage(f) => f(message),
        }
    }
}

#[derive(Clone)]
pub struct AmqpMessageDispatcherOptions {
    pub exchange: Resolver,
    pub routing_key: Resolver,
    pub max_tries: u32,
    pub channel_timeout: Option<Duration>,
}

impl AmqpMessageDispatcherOptions {
    /// `routing_key` defaults to each message's own `type` (spec §6:
    /// "routingKey? (default: message.type)"), overridable via
    /// `routing_key: Resolver::Static(...)` or `Resolver::PerMessage(...)`.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: Resolver::Static(exchange.into()),
            routing_key: Resolver::PerMessage(Arc::new(|m: &Message| m.message_type().to_string())),
            max_tries: 3,
            channel_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Publishes every message in a run as a persistent, confirm-mode AMQP
/// message, retrying the whole run on a fresh channel up to
/// `max_tries` times. A publish failure on a later message in the run
/// does not roll back the earlier ones already on the wire; the caller
/// will re-dispatch the whole run, so a downstream consumer must
/// tolerate duplicates, which is exactly what the at-least-once contract
/// around this dispatcher already assumes.
pub struct AmqpMessageDispatcher {
    pool: Arc<ChannelPool>,
    options: AmqpMessageDispatcherOptions,
}

impl AmqpMessageDispatcher {
    pub fn new(pool: Arc<ChannelPool>, options: AmqpMessageDispatcherOptions) -> Self {
        Self { pool, options }
    }

    async fn send_once(&self, messages: &[Message]) -> Result<(), AmqpError> {
        let channel = self.pool.channel(self.options.channel_timeout).await?;

        let mut confirms = Vec::with_capacity(messages.len());
        for message in messages {
            let exchange = self.options.exchange.resolve(message);
            let routing_key = self.options.routing_key.resolve(message);
            let payload = serde_json::to_vec(message)?;
            let confirm = channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    BasicProperties::default()
                        .with_delivery_mode(2)
                        .with_content_type("application/json".into()),
                )
                .await?;
            confirms.push(confirm);
        }

        try_join_all(confirms.into_iter().map(|c| async move { c.await })).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Dispatcher for AmqpMessageDispatcher {
    async fn dispatch(&self, messages: &[Message]) -> Result<(), DispatchError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 1..=self.options.max_tries {
            match self.send_once(messages).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, max_tries = self.options.max_tries, error = %e, "AMQP publish attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(DispatchError::new(format!(
            "giving up after {} attempts: {}",
            self.options.max_tries,
            last_error.expect("loop runs at least once")
        )))
    }
}
