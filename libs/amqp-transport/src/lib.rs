//! AMQP transport for the transactional outbox (spec C9).
//!
//! [`connection::AmqpConnectionProvider`] owns a named set of `lapin`
//! connections, reconnecting through `resilience`'s retry policy.
//! [`channel_pool::ChannelPool`] leases confirm-mode channels off one
//! connection. [`dispatcher::AmqpMessageDispatcher`] implements
//! `outbox_message::Dispatcher` on top of the pool, so an
//! `outbox_runner` runner can publish a relay's batches without knowing
//! AMQP exists. [`relay::AmqpMessageRelay`] is the other direction:
//! it consumes one or more queues, decodes envelopes, and routes each to
//! a [`relay::MessageConsumer`] through a [`partition::PartitionProcessor`]
//! keyed by aggregate so per-aggregate order survives concurrent
//! processing.

mod channel_pool;
mod connection;
mod dispatcher;
mod error;
mod partition;
mod relay;

pub use channel_pool::{ChannelPool, ChannelPoolOptions, PooledChannel};
pub use connection::{AmqpConnectionProvider, UrlResolver};
pub use dispatcher::{AmqpMessageDispatcher, AmqpMessageDispatcherOptions, Resolver};
pub use error::{AmqpError, AmqpResult};
pub use partition::PartitionProcessor;
pub use relay::{AmqpMessageRelay, AmqpMessageRelayOptions, MessageConsumer};
