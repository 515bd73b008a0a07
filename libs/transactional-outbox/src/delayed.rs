//! The delayed outbox variant: every write carries a `delay_until`
//! computed from a pluggable backoff strategy, and only rows whose delay
//! has elapsed are retrievable (spec §4.5).

use crate::error::OutboxResult;
use crate::repository::{BackoffStrategy, Clock, OutboxRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_context::ConnectionContext;
use outbox_message::{headers, Message};
use serde_json::Value;
use std::sync::Arc;

pub struct DelayedOutboxRepository {
    ctx: Arc<ConnectionContext>,
    table: String,
    clock: Arc<dyn Clock>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl DelayedOutboxRepository {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
        backoff: Arc<dyn BackoffStrategy>,
    ) -> Self {
        Self {
            ctx,
            table: table.into(),
            clock,
            backoff,
        }
    }

    /// Stamps `message` with its next `attempt` and the `delay_until` at
    /// which it becomes retrievable, per spec's write-time protocol.
    fn schedule(&self, mut message: Message) -> Message {
        let attempt = message.attempt().unwrap_or(0);
        let delay_until = self.clock.now_ms() + self.backoff.delay_ms(attempt);
        message.set_header(headers::ATTEMPT, attempt + 1);
        message.set_header(headers::DELAY_UNTIL, delay_until);
        message
    }

    /// Reset already-dispatched rows created at or after `since` back to
    /// pending and immediately retrievable, for operational backfill.
    pub async fn replay_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let table = self.table.clone();
        let now = ms_to_timestamp(self.clock.now_ms());
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed = false, delay_until = $1 \
                         WHERE consumed = true AND created_at >= $2"
                    ))
                    .bind(now)
                    .bind(since)
                    .execute(&mut *conn)
                    .await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;
        Ok(affected)
    }

    /// Reset already-dispatched rows whose id falls in `[from_id, to_id]`
    /// back to pending and immediately retrievable.
    pub async fn replay_range(&self, from_id: i64, to_id: i64) -> OutboxResult<u64> {
        let table = self.table.clone();
        let now = ms_to_timestamp(self.clock.now_ms());
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed = false, delay_until = $1 \
                         WHERE consumed = true AND id BETWEEN $2 AND $3"
                    ))
                    .bind(now)
                    .bind(from_id)
                    .bind(to_id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;
        Ok(affected)
    }
}

#[async_trait]
impl OutboxRepository for DelayedOutboxRepository {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn persist(&self, messages: Vec<Message>) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let rows = messages
            .into_iter()
            .map(|m| self.schedule(m))
            .map(|m| {
                let delay_until = m.delay_until_ms().expect("schedule always sets delay_until");
                serde_json::to_value(&m).map(|payload| (payload, delay_until))
            })
            .collect::<Result<Vec<(Value, i64)>, _>>()?;
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    for (payload, delay_until) in rows {
                        let delay_until = ms_to_timestamp(delay_until);
                        sqlx::query(&format!(
                            "INSERT INTO {table} (consumed, payload, delay_until, created_at) \
                             VALUES (false, $1, $2, now())"
                        ))
                        .bind(payload)
                        .bind(delay_until)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn retrieve_batch(&self, n: u32) -> OutboxResult<Vec<Message>> {
        let table = self.table.clone();
        let now = ms_to_timestamp(self.clock.now_ms());
        let rows: Vec<(i64, bool, Value)> = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_as::<_, (i64, bool, Value)>(&format!(
                        "SELECT id, consumed, payload FROM {table} \
                         WHERE consumed = false AND delay_until <= $1 \
                         ORDER BY id ASC LIMIT $2"
                    ))
                    .bind(now)
                    .bind(n as i64)
                    .fetch_all(&mut *conn)
                    .await?)
                })
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, consumed, payload) in rows {
            let mut message: Message = serde_json::from_value(payload)?;
            message.set_header(headers::OUTBOX_ID, id);
            message.set_header(headers::OUTBOX_TABLE, self.table.clone());
            message.set_header(headers::OUTBOX_CONSUMED, consumed);
            out.push(message);
        }
        Ok(out)
    }

    async fn mark_consumed(&self, messages: &[Message]) -> OutboxResult<()> {
        let ids: Vec<i64> = messages.iter().filter_map(|m| m.outbox_id()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    sqlx::query(&format!("UPDATE {table} SET consumed = true WHERE id = ANY($1)"))
                        .bind(ids)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn cleanup_consumed_messages(&self, limit: u32) -> OutboxResult<u64> {
        let table = self.table.clone();
        let deleted = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "DELETE FROM {table} WHERE id IN \
                         (SELECT id FROM {table} WHERE consumed = true ORDER BY id ASC LIMIT $1)"
                    ))
                    .bind(limit as i64)
                    .execute(&mut *conn)
                    .await?;
                    Ok(result.rows_affected())
                })
            })
            .await?;
        Ok(deleted)
    }

    async fn number_of_pending_messages(&self) -> OutboxResult<i64> {
        let table = self.table.clone();
        let count = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar::<_, i64>(&format!(
                        "SELECT count(*) FROM {table} WHERE consumed = false"
                    ))
                    .fetch_one(&mut *conn)
                    .await?)
                })
            })
            .await?;
        Ok(count)
    }

    async fn number_of_consumed_messages(&self) -> OutboxResult<i64> {
        let table = self.table.clone();
        let count = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar::<_, i64>(&format!(
                        "SELECT count(*) FROM {table} WHERE consumed = true"
                    ))
                    .fetch_one(&mut *conn)
                    .await?)
                })
            })
            .await?;
        Ok(count)
    }

    async fn oldest_pending_age_seconds(&self) -> OutboxResult<Option<f64>> {
        let table = self.table.clone();
        let age: Option<f64> = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar::<_, Option<f64>>(&format!(
                        "SELECT EXTRACT(EPOCH FROM (now() - min(created_at))) FROM {table} \
                         WHERE consumed = false"
                    ))
                    .fetch_one(&mut *conn)
                    .await?)
                })
            })
            .await?;
        Ok(age)
    }

    async fn truncate(&self) -> OutboxResult<()> {
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    sqlx::query(&format!("TRUNCATE TABLE {table} RESTART IDENTITY"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }
}

fn ms_to_timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::LinearBackoff;
    use outbox_message::headers;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FixedClock(AtomicI64);
    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn schedule_defaults_attempt_to_zero_and_advances_it() {
        let repo_clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let backoff = Arc::new(LinearBackoff { k_ms: 500 });
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let ctx = db_context::ConnectionContext::new(pool, db_context::ConnectionContextOptions::default());
        let repo = DelayedOutboxRepository::new(ctx, "outbox_delayed", repo_clock, backoff);

        let scheduled = repo.schedule(Message::new("x", serde_json::json!({})));
        assert_eq!(scheduled.attempt(), Some(1));
        assert_eq!(scheduled.delay_until_ms(), Some(1_000));
    }

    #[test]
    fn schedule_scales_delay_with_prior_attempt() {
        let repo_clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let backoff = Arc::new(LinearBackoff { k_ms: 500 });
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/test").unwrap();
        let ctx = db_context::ConnectionContext::new(pool, db_context::ConnectionContextOptions::default());
        let repo = DelayedOutboxRepository::new(ctx, "outbox_delayed", repo_clock, backoff);

        let retried = Message::new("x", serde_json::json!({})).with_header(headers::ATTEMPT, 3);
        let scheduled = repo.schedule(retried);
        assert_eq!(scheduled.attempt(), Some(4));
        assert_eq!(scheduled.delay_until_ms(), Some(1_000 + 500 * 3));
    }
}
