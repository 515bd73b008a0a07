//! The shared outbox repository contract (spec C5) and the clock
//! abstraction its delayed/throttled variants need for testable time.

use crate::error::OutboxResult;
use async_trait::async_trait;
use outbox_message::Message;

/// Persists, retrieves, and retires rows in one outbox table.
///
/// `retrieve_batch` returns an owned `Vec<Message>` bounded by `n` rather
/// than a lazy generator/stream: `n` already bounds the memory a caller
/// pays for a batch, and every relay in this workspace consumes a batch to
/// completion before asking for the next one, so nothing is gained by
/// making the sequence lazy — only a channel to plumb through every
/// implementation.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// The table this repository reads and writes.
    fn table_name(&self) -> &str;

    /// Append `messages` to the outbox in the same statement context as
    /// whatever business-logic transaction is open on the repository's
    /// connection context (spec's "same DB transaction" guarantee).
    async fn persist(&self, messages: Vec<Message>) -> OutboxResult<()>;

    /// Fetch up to `n` unconsumed rows, oldest first, each augmented with
    /// `outbox_id`/`outbox_table`/`outbox_consumed` headers.
    async fn retrieve_batch(&self, n: u32) -> OutboxResult<Vec<Message>>;

    /// Mark the given messages consumed. Messages not carrying an
    /// `outbox_id` header (i.e. not originally returned by this
    /// repository) are ignored.
    async fn mark_consumed(&self, messages: &[Message]) -> OutboxResult<()>;

    /// Delete up to `limit` consumed rows, returning how many were
    /// deleted.
    async fn cleanup_consumed_messages(&self, limit: u32) -> OutboxResult<u64>;

    /// Count of rows not yet consumed.
    async fn number_of_pending_messages(&self) -> OutboxResult<i64>;

    /// Age in seconds of the oldest row still pending, or `None` if
    /// nothing is pending. Feeds the `outbox_oldest_pending_age_seconds`
    /// gauge a relay runner refreshes on each poll tick.
    async fn oldest_pending_age_seconds(&self) -> OutboxResult<Option<f64>>;

    /// Count of rows already consumed and not yet cleaned up.
    async fn number_of_consumed_messages(&self) -> OutboxResult<i64>;

    /// Remove every row in the table. Intended for test fixtures.
    async fn truncate(&self) -> OutboxResult<()>;
}

/// Abstracts "now" so delayed/throttled scheduling can be driven
/// deterministically in tests instead of racing the wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real clock, backed by `chrono::Utc::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Computes the delay (in milliseconds) before attempt number `attempt`
/// (1-based) of a message should become visible.
pub trait BackoffStrategy: Send + Sync {
    fn delay_ms(&self, attempt: u32) -> i64;
}

/// `delay = k_ms * attempt`, the reference policy named in spec §4.5.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub k_ms: i64,
}

impl BackoffStrategy for LinearBackoff {
    fn delay_ms(&self, attempt: u32) -> i64 {
        self.k_ms * attempt as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let backoff = LinearBackoff { k_ms: 100 };
        assert_eq!(backoff.delay_ms(1), 100);
        assert_eq!(backoff.delay_ms(3), 300);
    }

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
