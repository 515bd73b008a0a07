//! The throttled outbox variant: collapses bursts under one
//! `idempotency_key` to at most one publication per rolling window of
//! `window_ms`, guaranteeing a single post-window publication of the most
//! recent payload (spec §4.5).
//!
//! The four-branch upsert policy is expressed as one `INSERT ... ON
//! CONFLICT DO UPDATE` whose `CASE` arms read the pre-conflict row via the
//! table's own (unqualified) column references — Postgres makes both the
//! proposed (`EXCLUDED`) and existing row visible in that clause, so the
//! whole policy commits atomically with no read-then-write race.

use crate::error::OutboxResult;
use crate::repository::{Clock, OutboxRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_context::ConnectionContext;
use outbox_message::{headers, Message};
use serde_json::Value;
use std::sync::Arc;

/// Resolves the idempotency key a message collapses under.
pub type KeyResolver = Arc<dyn Fn(&Message) -> String + Send + Sync>;

pub struct ThrottledOutboxRepository {
    ctx: Arc<ConnectionContext>,
    table: String,
    clock: Arc<dyn Clock>,
    key_resolver: KeyResolver,
    window_ms: i64,
}

impl ThrottledOutboxRepository {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        table: impl Into<String>,
        clock: Arc<dyn Clock>,
        key_resolver: KeyResolver,
        window_ms: i64,
    ) -> Self {
        Self {
            ctx,
            table: table.into(),
            clock,
            key_resolver,
            window_ms,
        }
    }

    /// Reset already-dispatched rows created at or after `since` back to
    /// both pending phases, for operational backfill. A row mid-window
    /// (not yet eligible for its delayed phase) is left alone; only rows
    /// that have fully cleared both phases are reopened.
    pub async fn replay_since(&self, since: DateTime<Utc>) -> OutboxResult<u64> {
        let table = self.table.clone();
        let now = ms_to_timestamp(self.clock.now_ms());
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed_initially = false, \
                            consumed_delayed = false, should_dispatch_delayed = false, \
                            delay_until = $1 \
                         WHERE consumed_initially = true \
                           AND (should_dispatch_delayed = false OR consumed_delayed = true) \
                           AND created_at >= $2"
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
    /// back to both pending phases.
    pub async fn replay_range(&self, from_id: i64, to_id: i64) -> OutboxResult<u64> {
        let table = self.table.clone();
        let now = ms_to_timestamp(self.clock.now_ms());
        let affected = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "UPDATE {table} SET consumed_initially = false, \
                            consumed_delayed = false, should_dispatch_delayed = false, \
                            delay_until = $1 \
                         WHERE consumed_initially = true \
                           AND (should_dispatch_delayed = false OR consumed_delayed = true) \
                           AND id BETWEEN $2 AND $3"
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
impl OutboxRepository for ThrottledOutboxRepository {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn persist(&self, messages: Vec<Message>) -> OutboxResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let now_ms = self.clock.now_ms();
        let now = ms_to_timestamp(now_ms);
        let fresh_delay_until = ms_to_timestamp(now_ms + self.window_ms);
        let rows = messages
            .into_iter()
            .map(|m| {
                let key = (self.key_resolver)(&m);
                serde_json::to_value(&m).map(|payload| (key, payload))
            })
            .collect::<Result<Vec<(String, Value)>, _>>()?;
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    for (key, payload) in rows {
                        sqlx::query(&format!(
                            "INSERT INTO {table} \
                                (idempotency_key, payload, delay_until, consumed_initially, \
                                 should_dispatch_delayed, consumed_delayed, created_at) \
                             VALUES ($1, $2, $3, false, false, false, now()) \
                             ON CONFLICT (idempotency_key) DO UPDATE SET \
                                payload = EXCLUDED.payload, \
                                delay_until = CASE \
                                    WHEN {table}.consumed_initially = true \
                                         AND {table}.delay_until <= $4 \
                                    THEN EXCLUDED.delay_until \
                                    ELSE {table}.delay_until \
                                END, \
                                consumed_initially = CASE \
                                    WHEN {table}.consumed_initially = true \
                                         AND {table}.delay_until <= $4 \
                                    THEN false \
                                    ELSE {table}.consumed_initially \
                                END, \
                                should_dispatch_delayed = CASE \
                                    WHEN {table}.consumed_initially = true \
                                         AND {table}.delay_until <= $4 \
                                    THEN false \
                                    WHEN {table}.consumed_initially = true \
                                    THEN true \
                                    ELSE {table}.should_dispatch_delayed \
                                END, \
                                consumed_delayed = CASE \
                                    WHEN {table}.consumed_initially = true \
                                         AND {table}.delay_until <= $4 \
                                    THEN false \
                                    ELSE {table}.consumed_delayed \
                                END"
                        ))
                        .bind(key)
                        .bind(payload)
                        .bind(fresh_delay_until)
                        .bind(now)
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
                        "SELECT id, consumed_initially, payload FROM {table} \
                         WHERE consumed_initially = false \
                            OR (consumed_initially = true AND should_dispatch_delayed = true \
                                AND consumed_delayed = false AND delay_until <= $1) \
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
        for (id, consumed_initially, payload) in rows {
            let mut message: Message = serde_json::from_value(payload)?;
            let phase = if consumed_initially { "delayed" } else { "initial" };
            message.set_header(headers::OUTBOX_ID, id);
            message.set_header(headers::OUTBOX_TABLE, self.table.clone());
            message.set_header(headers::OUTBOX_THROTTLE_PHASE, phase);
            out.push(message);
        }
        Ok(out)
    }

    async fn mark_consumed(&self, messages: &[Message]) -> OutboxResult<()> {
        let mut initial_ids = Vec::new();
        let mut delayed_ids = Vec::new();
        for message in messages {
            let Some(id) = message.outbox_id() else {
                continue;
            };
            match message.header(headers::OUTBOX_THROTTLE_PHASE).and_then(|v| v.as_str()) {
                Some("delayed") => delayed_ids.push(id),
                _ => initial_ids.push(id),
            }
        }
        if initial_ids.is_empty() && delayed_ids.is_empty() {
            return Ok(());
        }
        let table = self.table.clone();
        self.ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    if !initial_ids.is_empty() {
                        sqlx::query(&format!(
                            "UPDATE {table} SET consumed_initially = true WHERE id = ANY($1)"
                        ))
                        .bind(initial_ids)
                        .execute(&mut *conn)
                        .await?;
                    }
                    if !delayed_ids.is_empty() {
                        sqlx::query(&format!(
                            "UPDATE {table} SET consumed_delayed = true WHERE id = ANY($1)"
                        ))
                        .bind(delayed_ids)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn cleanup_consumed_messages(&self, limit: u32) -> OutboxResult<u64> {
        let table = self.table.clone();
        let cutoff = ms_to_timestamp(self.clock.now_ms() - self.window_ms);
        let deleted = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    let result = sqlx::query(&format!(
                        "DELETE FROM {table} WHERE id IN ( \
                            SELECT id FROM {table} \
                            WHERE consumed_initially = true \
                              AND (should_dispatch_delayed = false OR consumed_delayed = true) \
                              AND delay_until <= $1 \
                            ORDER BY id ASC LIMIT $2)"
                    ))
                    .bind(cutoff)
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
        let now = ms_to_timestamp(self.clock.now_ms());
        let count = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar::<_, i64>(&format!(
                        "SELECT count(*) FROM {table} \
                         WHERE consumed_initially = false \
                            OR (consumed_initially = true AND should_dispatch_delayed = true \
                                AND consumed_delayed = false AND delay_until <= $1)"
                    ))
                    .bind(now)
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
                        "SELECT count(*) FROM {table} \
                         WHERE consumed_initially = true \
                           AND (should_dispatch_delayed = false OR consumed_delayed = true)"
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
        let now = ms_to_timestamp(self.clock.now_ms());
        let age: Option<f64> = self
            .ctx
            .with_connection(|conn| {
                Box::pin(async move {
                    Ok(sqlx::query_scalar::<_, Option<f64>>(&format!(
                        "SELECT EXTRACT(EPOCH FROM (now() - min(created_at))) FROM {table} \
                         WHERE consumed_initially = false \
                            OR (consumed_initially = true AND should_dispatch_delayed = true \
                                AND consumed_delayed = false AND delay_until <= $1)"
                    ))
                    .bind(now)
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

    #[test]
    fn ms_to_timestamp_round_trips_to_the_millisecond() {
        let ts = ms_to_timestamp(1_700_000_000_123);
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }
}
