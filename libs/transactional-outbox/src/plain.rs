//! The plain outbox variant: `persist`/`retrieveBatch` with no delay or
//! throttling, predicate `consumed = false` (spec §4.5).

use crate::error::OutboxResult;
use crate::repository::OutboxRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_context::ConnectionContext;
use outbox_message::{headers, Message};
use serde_json::Value;
use std::sync::Arc;

pub struct PlainOutboxRepository {
    ctx: Arc<ConnectionContext>,
    table: String,
}

impl PlainOutboxRepository {
    pub fn new(ctx: Arc<ConnectionContext>, table: impl Into<String>) -> Self {
        Self {
            ctx,
            table: table.into(),
        }
    }

    /// Reset already-dispatched rows created at or after `since` back to
    /// pending, for operational backfill after a downstream outage.
    /// Returns the number of rows reset.
    pub async fn replay_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let table = self.table.clone();
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed = false \
                         WHERE consumed = true AND created_at >= $1"
                    ))
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
    /// back to pending, for targeted operational backfill.
    pub async fn replay_range(&self, from_id: i64, to_id: i64) -> OutboxResult<u64> {
        let table = self.table.clone();
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed = false \
                         WHERE consumed = true AND id BETWEEN $1 AND $2"
                    ))
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
impl OutboxRepository for PlainOutboxRepository {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn persist(&self, messages: Vec<Message>) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let payloads = messages
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    for payload in payloads {
                        sqlx::query(&format!(
                            "INSERT INTO {table} (consumed, payload, created_at) \
                             VALUES (false, $1, now())"
                        ))
                        .bind(payload)
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
        let rows: Vec<(i64, bool, Value)> = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_as::<_, (i64, bool, Value)>(&format!(
                        "SELECT id, consumed, payload FROM {table} \
                         WHERE consumed = false ORDER BY id ASC LIMIT $1"
                    ))
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
        let count: i64 = self
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
        let count: i64 = self
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

#[cfg(test)]
mod tests {
    use super::*;
    use db_context::ConnectionContextOptions;
    use sqlx::PgPool;

    fn repo() -> PlainOutboxRepository {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").expect("lazy pool");
        let ctx = ConnectionContext::new(pool, ConnectionContextOptions::default());
        PlainOutboxRepository::new(ctx, "outbox")
    }

    #[tokio::test]
    async fn persist_with_no_messages_never_touches_the_connection() {
        let repo = repo();
        repo.persist(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn mark_consumed_with_no_outbox_ids_is_a_no_op() {
        let repo = repo();
        let msg = Message::new("x", serde_json::json!({}));
        repo.mark_consumed(&[msg]).await.unwrap();
    }
}
