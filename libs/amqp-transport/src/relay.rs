//! Inbound side: consumes queues, decodes envelopes, and hands each one
//! to a [`MessageConsumer`] with delivery-count-tracked ack/nack (spec
//! C9's consumer relay).

use crate::connection::AmqpConnectionProvider;
use crate::error::AmqpResult;
use crate::partition::PartitionProcessor;
use async_trait::async_trait;
use futures_util::stream::{select_all, StreamExt};
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use outbox_message::{headers, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Handles one decoded message. An `Err` causes a nack; whether it is
/// requeued or dead-lettered depends on how many times this delivery's
/// `event_id` has already been attempted.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn consume(&self, message: &Message) -> Result<(), String>;
}

#[derive(Clone)]
pub struct AmqpMessageRelayOptions {
    pub queue_names: Vec<String>,
    pub max_delivery_attempts: u32,
    pub prefetch: u16,
    pub partition_lanes: usize,
}

impl AmqpMessageRelayOptions {
    pub fn new(queue_names: Vec<String>) -> Self {
        Self {
            queue_names,
            max_delivery_attempts: 5,
            prefetch: 32,
            partition_lanes: 8,
        }
    }
}

/// Consumes every configured queue on one channel, merging their
/// delivery streams, and routes each decoded message to `consumer`
/// through a [`PartitionProcessor`] keyed by aggregate root id so that
/// per-aggregate ordering is preserved while unrelated aggregates process
/// concurrently.
pub struct AmqpMessageRelay {
    provider: Arc<AmqpConnectionProvider>,
    connection_name: Option<String>,
    consumer: Arc<dyn MessageConsumer>,
    options: AmqpMessageRelayOptions,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl AmqpMessageRelay {
    pub fn new(
        provider: Arc<AmqpConnectionProvider>,
        connection_name: Option<String>,
        consumer: Arc<dyn MessageConsumer>,
        options: AmqpMessageRelayOptions,
    ) -> Self {
        Self {
            provider,
            connection_name,
            consumer,
            options,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs until cancelled, reopening the channel transparently if the
    /// broker closes it.
    pub async fn run(&self) -> AmqpResult<()> {
        loop {
            if let Err(e) = self.consume_once().await {
                warn!(error = %e, "AMQP consumer channel closed, reconnecting");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    async fn consume_once(&self) -> AmqpResult<()> {
        let conn = self.provider.connection(self.connection_name.as_deref()).await?;
        let channel = conn.create_channel().await?;
        channel
            .basic_qos(self.options.prefetch, BasicQosOptions::default())
            .await?;

        let processor = PartitionProcessor::new(self.options.partition_lanes);

        let mut streams = Vec::with_capacity(self.options.queue_names.len());
        for queue in &self.options.queue_names {
            let queue = queue.clone();
            let consumer = channel
                .basic_consume(
                    &queue,
                    &format!("amqp-transport-{queue}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            streams.push(consumer.map(move |d| d.map(|delivery| (queue.clone(), delivery))));
        }

        let mut deliveries = select_all(streams);
        while let Some(delivery) = deliveries.next().await {
            let (queue, delivery) = delivery?;
            let relay = self.clone_handles();
            let partition_key = partition_key_for(&delivery.data);
            processor.submit(
                partition_key.as_bytes(),
                Box::pin(async move {
                    relay.handle_delivery(queue, delivery).await;
                }),
            );
        }
        Ok(())
    }

    fn clone_handles(&self) -> HandleContext {
        HandleContext {
            consumer: Arc::clone(&self.consumer),
            attempts: Arc::clone(&self.attempts),
            max_delivery_attempts: self.options.max_delivery_attempts,
        }
    }
}

/// The partition lane selector for one delivery: the aggregate root id if
/// the envelope carries one, so every message for the same aggregate
/// lands on the same serial lane (spec §3's partition processor, §4.9 /
/// §5 ordering guarantee); otherwise the raw bytes, which still gives a
/// deterministic lane but carries no ordering promise since there is no
/// aggregate to order.
fn partition_key_for(raw: &[u8]) -> String {
    match serde_json::from_slice::<Message>(raw) {
        Ok(message) => match message.aggregate_root_id() {
            Some(id) => id.to_string(),
            None => String::from_utf8_lossy(raw).into_owned(),
        },
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

struct HandleContext {
    consumer: Arc<dyn MessageConsumer>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    max_delivery_attempts: u32,
}

impl HandleContext {
    async fn handle_delivery(&self, queue: String, delivery: lapin::message::Delivery) {
        let mut message: Message = match serde_json::from_slice(&delivery.data) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "undecodable AMQP delivery, dead-lettering");
                if let Err(e) = delivery.nack(BasicNackOptions { requeue: false, multiple: false }).await {
                    error!(error = %e, "failed to nack undecodable delivery");
                }
                return;
            }
        };
        message.set_header(headers::AMQP_QUEUE_NAME, queue);

        match self.consumer.consume(&message).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "failed to ack delivery");
                }
            }
            Err(reason) => {
                let event_id = message.event_id().unwrap_or_default().to_string();
                let attempts = {
                    let mut guard = self.attempts.lock().await;
                    let count = guard.entry(event_id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let requeue = attempts < self.max_delivery_attempts;
                warn!(event_id, attempts, requeue, reason, "message consumer failed");
                if !requeue {
                    self.attempts.lock().await.remove(&event_id);
                }
                if let Err(e) = delivery.nack(BasicNackOptions { requeue, multiple: false }).await {
                    error!(error = %e, "failed to nack delivery");
                }
            }
        }
    }
}
