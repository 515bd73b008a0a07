//! The notifying outbox decorator (spec C6): wraps any [`OutboxRepository`]
//! and, on `persist`, emits a Postgres `NOTIFY` in the same transaction as
//! the write so that listeners only observe it once the rows are visible.

use crate::error::OutboxResult;
use crate::repository::OutboxRepository;
use async_trait::async_trait;
use db_context::ConnectionContext;
use outbox_message::Message;
use std::sync::Arc;

/// Which notifications a [`NotifyingOutboxRepository`] emits per write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStyle {
    /// No `NOTIFY`; equivalent to not wrapping the repository at all.
    None,
    /// One dedicated channel per table: `<prefix>__<table>`, empty payload.
    Channel,
    /// One shared channel: `<prefix>`, payload is the table name.
    Central,
    /// Both of the above.
    Both,
}

#[derive(Debug, Clone)]
pub struct NotifyingOutboxOptions {
    pub style: NotifyStyle,
    pub channel_name: String,
}

pub struct NotifyingOutboxRepository<R> {
    inner: R,
    ctx: Arc<ConnectionContext>,
    options: NotifyingOutboxOptions,
}

impl<R: OutboxRepository> NotifyingOutboxRepository<R> {
    /// `ctx` must be the same connection context the wrapped repository
    /// itself routes through, so that the transaction this decorator opens
    /// is the one `inner.persist` writes into.
    pub fn new(inner: R, ctx: Arc<ConnectionContext>, options: NotifyingOutboxOptions) -> Self {
        Self { inner, ctx, options }
    }

    async fn notify(&self) -> OutboxResult<()> {
        let table = self.inner.table_name().to_string();
        match self.options.style {
            NotifyStyle::None => Ok(()),
            NotifyStyle::Channel => self.notify_raw(&self.channel_name(&table), "").await,
            NotifyStyle::Central => self.notify_raw(&self.options.channel_name, &table).await,
            NotifyStyle::Both => {
                self.notify_raw(&self.channel_name(&table), "").await?;
                self.notify_raw(&self.options.channel_name, &table).await
            }
        }
    }

    fn channel_name(&self, table: &str) -> String {
        format!("{}__{}", self.options.channel_name, table)
    }

    async fn notify_raw(&self, channel: &str, payload: &str) -> OutboxResult<()> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    sqlx::query("SELECT pg_notify($1, $2)")
                        .bind(channel)
                        .bind(payload)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<R: OutboxRepository> OutboxRepository for NotifyingOutboxRepository<R> {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    async fn persist(&self, messages: Vec<Message>) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if self.ctx.in_transaction().await {
            self.inner.persist(messages).await?;
            return self.notify().await;
        }

        let handle = self.ctx.begin(None).await?;
        let result = async {
            self.inner.persist(messages).await?;
            self.notify().await
        }
        .await;
        match result {
            Ok(()) => {
                self.ctx.commit(handle).await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = self.ctx.rollback(handle).await {
                    tracing::warn!(
                        error = %rollback_err,
                        "rollback after failed notifying persist also failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn retrieve_batch(&self, n: u32) -> OutboxResult<Vec<Message>> {
        self.inner.retrieve_batch(n).await
    }

    async fn mark_consumed(&self, messages: &[Message]) -> OutboxResult<()> {
        self.inner.mark_consumed(messages).await
    }

    async fn cleanup_consumed_messages(&self, limit: u32) -> OutboxResult<u64> {
        self.inner.cleanup_consumed_messages(limit).await
    }

    async fn number_of_pending_messages(&self) -> OutboxResult<i64> {
        self.inner.number_of_pending_messages().await
    }

    async fn oldest_pending_age_seconds(&self) -> OutboxResult<Option<f64>> {
        self.inner.oldest_pending_age_seconds().await
    }

    async fn number_of_consumed_messages(&self) -> OutboxResult<i64> {
        self.inner.number_of_consumed_messages().await
    }

    async fn truncate(&self) -> OutboxResult<()> {
        self.inner.truncate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_joins_prefix_and_table() {
        let options = NotifyingOutboxOptions {
            style: NotifyStyle::Channel,
            channel_name: "outbox".into(),
        };
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let ctx = ConnectionContext::new(pool, db_context::ConnectionContextOptions::default());
        let repo = crate::plain::PlainOutboxRepository::new(ctx.clone(), "orders_outbox");
        let decorated = NotifyingOutboxRepository::new(repo, ctx, options);
        assert_eq!(decorated.channel_name("orders_outbox"), "outbox__orders_outbox");
    }
}
