//! The outbox relay (spec C7): pulls a batch from a repository, hands it
//! to a downstream [`Dispatcher`] in commit-sized runs, and marks each run
//! consumed only once it has actually gone out.

use crate::error::{OutboxError, OutboxResult};
use crate::metrics::OutboxMetrics;
use crate::repository::OutboxRepository;
use outbox_message::Dispatcher;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pairs one outbox repository with the dispatcher its messages get sent
/// to. Stateless between calls to [`relay_batch`](Self::relay_batch) —
/// ordering and leader-election live one layer up, in a relay runner.
pub struct OutboxRelay {
    repository: Arc<dyn OutboxRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    metrics: Option<OutboxMetrics>,
}

impl OutboxRelay {
    pub fn new(repository: Arc<dyn OutboxRepository>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            repository,
            dispatcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retrieve up to `batch_size` pending messages and dispatch them in
    /// runs of `commit_size`, marking each run consumed immediately after
    /// it is confirmed sent. The first run a dispatch fails on aborts the
    /// whole call: later runs in the batch are left untouched (still
    /// pending) and the error propagates, rather than risk dispatching
    /// out of order.
    ///
    /// Returns the number of messages successfully dispatched and marked
    /// consumed.
    pub async fn relay_batch(&self, batch_size: u32, commit_size: u32) -> OutboxResult<u32> {
        self.refresh_pending_gauges().await?;

        let batch = self.repository.retrieve_batch(batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let commit_size = commit_size.max(1) as usize;
        let mut dispatched = 0u32;

        for run in batch.chunks(commit_size) {
            if let Err(e) = self.dispatcher.dispatch(run).await {
                warn!(
                    error = %e,
                    dispatched_so_far = dispatched,
                    run_size = run.len(),
                    "outbox relay aborting batch after a dispatch failure"
                );
                return Err(OutboxError::DispatchFailed(e.to_string()));
            }

            self.repository.mark_consumed(run).await?;
            dispatched += run.len() as u32;

            if let Some(metrics) = &self.metrics {
                metrics.published.inc_by(run.len() as u64);
            }
        }

        debug!(dispatched, table = self.repository.table_name(), "outbox relay batch complete");
        Ok(dispatched)
    }

    async fn refresh_pending_gauges(&self) -> OutboxResult<()> {
        let Some(metrics) = &self.metrics else {
            return Ok(());
        };
        metrics.pending.set(self.repository.number_of_pending_messages().await?);
        metrics
            .oldest_pending_age_seconds
            .set(self.repository.oldest_pending_age_seconds().await?.unwrap_or(0.0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outbox_message::{DispatchError, Message};
    use parking_lot::Mutex;
    use serde_json::Value;

    struct FakeRepository {
        pending: Mutex<Vec<Message>>,
        consumed: Mutex<Vec<Message>>,
    }

    impl FakeRepository {
        fn with_messages(n: usize) -> Self {
            let pending = (0..n)
                .map(|i| Message::new("x", Value::Null).with_header("outbox_id", i as i64))
                .collect();
            Self {
                pending: Mutex::new(pending),
                consumed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OutboxRepository for FakeRepository {
        fn table_name(&self) -> &str {
            "fake"
        }

        async fn persist(&self, _messages: Vec<Message>) -> OutboxResult<()> {
            Ok(())
        }

        async fn retrieve_batch(&self, n: u32) -> OutboxResult<Vec<Message>> {
            let mut pending = self.pending.lock();
            let take = (n as usize).min(pending.len());
            Ok(pending.drain(..take).collect())
        }

        async fn mark_consumed(&self, messages: &[Message]) -> OutboxResult<()> {
            self.consumed.lock().extend_from_slice(messages);
            Ok(())
        }

        async fn cleanup_consumed_messages(&self, _limit: u32) -> OutboxResult<u64> {
            Ok(0)
        }

        async fn number_of_pending_messages(&self) -> OutboxResult<i64> {
            Ok(self.pending.lock().len() as i64)
        }

        async fn number_of_consumed_messages(&self) -> OutboxResult<i64> {
            Ok(self.consumed.lock().len() as i64)
        }

        async fn oldest_pending_age_seconds(&self) -> OutboxResult<Option<f64>> {
            Ok(if self.pending.lock().is_empty() { None } else { Some(0.0) })
        }

        async fn truncate(&self) -> OutboxResult<()> {
            Ok(())
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl Dispatcher for FailingDispatcher {
        async fn dispatch(&self, _messages: &[Message]) -> Result<(), DispatchError> {
            Err(DispatchError::new("broker unreachable"))
        }
    }

    struct RecordingDispatcher {
        sent: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, messages: &[Message]) -> Result<(), DispatchError> {
            self.sent.lock().push(messages.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_in_commit_sized_runs_and_marks_each_consumed() {
        let repo = Arc::new(FakeRepository::with_messages(5));
        let dispatcher = Arc::new(RecordingDispatcher { sent: Mutex::new(Vec::new()) });
        let relay = OutboxRelay::new(repo.clone(), dispatcher.clone());

        let dispatched = relay.relay_batch(10, 2).await.unwrap();

        assert_eq!(dispatched, 5);
        assert_eq!(*dispatcher.sent.lock(), vec![2, 2, 1]);
        assert_eq!(repo.consumed.lock().len(), 5);
        assert_eq!(repo.pending.lock().len(), 0);
    }

    #[tokio::test]
    async fn empty_batch_short_circuits_without_touching_the_dispatcher() {
        let repo = Arc::new(FakeRepository::with_messages(0));
        let dispatcher = Arc::new(RecordingDispatcher { sent: Mutex::new(Vec::new()) });
        let relay = OutboxRelay::new(repo, dispatcher.clone());

        let dispatched = relay.relay_batch(10, 2).await.unwrap();

        assert_eq!(dispatched, 0);
        assert!(dispatcher.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn a_failed_run_aborts_the_batch_and_leaves_later_runs_pending() {
        let repo = Arc::new(FakeRepository::with_messages(4));
        let dispatcher = Arc::new(FailingDispatcher);
        let relay = OutboxRelay::new(repo.clone(), dispatcher);

        let err = relay.relay_batch(10, 2).await.unwrap_err();

        assert!(matches!(err, OutboxError::DispatchFailed(_)));
        assert_eq!(repo.consumed.lock().len(), 0);
    }
}
