//! Relay runners (spec C8): the scheduling layer that decides *when* an
//! [`transactional_outbox::OutboxRelay`] runs.
//!
//! Both runners share the same shape: contend for leadership via a
//! [`distributed_lock::StaticMutex`] so at most one process drives a given
//! stream at a time, `LISTEN` on a channel a
//! [`transactional_outbox::NotifyingOutboxRepository`] `NOTIFY`s, and fall
//! back to a poll timer so a missed notification (or a relay that wasn't
//! running for one) never leaves rows stuck. [`SingleStreamRunner`] drives
//! one relay; [`MultiStreamRunner`] drives several under one leader
//! election and one shared channel, picking the stream to process from the
//! notification payload.
//!
//! Neither runner retries leadership loss or relay errors itself — both
//! terminate `start()`'s future with the error, by design: the process
//! supervising this runner (a `tokio::spawn` wrapper, a service's main
//! loop) decides whether and how to restart.

mod error;
mod lifecycle;
mod metrics;
mod multi;
mod single;

pub use error::{RunnerError, RunnerResult};
pub use lifecycle::LifecycleState;
pub use metrics::RunnerMetrics;
pub use multi::{MultiStreamRunner, MultiStreamRunnerOptions};
pub use single::{SingleStreamRunner, SingleStreamRunnerOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use db_context::{ConnectionContext, ConnectionContextOptions};
    use distributed_lock::InMemoryStaticMutex;
    use outbox_message::{DispatchError, Message};
    use sqlx::PgPool;
    use std::sync::Arc;
    use transactional_outbox::{OutboxError, OutboxRelay, OutboxRepository, OutboxResult};

    struct EmptyRepository;

    #[async_trait]
    impl OutboxRepository for EmptyRepository {
        fn table_name(&self) -> &str {
            "empty"
        }

        async fn persist(&self, _messages: Vec<Message>) -> OutboxResult<()> {
            Ok(())
        }

        async fn retrieve_batch(&self, _n: u32) -> OutboxResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn mark_consumed(&self, _messages: &[Message]) -> OutboxResult<()> {
            Ok(())
        }

        async fn cleanup_consumed_messages(&self, _limit: u32) -> OutboxResult<u64> {
            Ok(0)
        }

        async fn number_of_pending_messages(&self) -> OutboxResult<i64> {
            Ok(0)
        }

        async fn number_of_consumed_messages(&self) -> OutboxResult<i64> {
            Ok(0)
        }

        async fn oldest_pending_age_seconds(&self) -> OutboxResult<Option<f64>> {
            Ok(None)
        }

        async fn truncate(&self) -> OutboxResult<()> {
            Ok(())
        }
    }

    struct NoopDispatcher;

    #[async_trait]
    impl outbox_message::Dispatcher for NoopDispatcher {
        async fn dispatch(&self, _messages: &[Message]) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn test_ctx() -> Arc<ConnectionContext> {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").expect("lazy pool");
        ConnectionContext::new(pool, ConnectionContextOptions::default())
    }

    #[tokio::test]
    async fn starting_twice_returns_already_started() {
        let ctx = test_ctx();
        let leader: Arc<dyn distributed_lock::StaticMutex> = Arc::new(InMemoryStaticMutex::new());
        let relay = Arc::new(OutboxRelay::new(Arc::new(EmptyRepository), Arc::new(NoopDispatcher)));
        let runner = SingleStreamRunner::new(
            ctx,
            leader,
            relay,
            SingleStreamRunnerOptions::new("outbox_channel"),
        );

        runner.stop(); // request shutdown before start so acquire_leadership returns immediately
        runner.start().await.unwrap();

        assert!(matches!(runner.start().await, Err(RunnerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn stop_before_start_returns_without_acquiring_leadership() {
        let ctx = test_ctx();
        let leader: Arc<dyn distributed_lock::StaticMutex> = Arc::new(InMemoryStaticMutex::new());
        let relay = Arc::new(OutboxRelay::new(Arc::new(EmptyRepository), Arc::new(NoopDispatcher)));
        let runner = SingleStreamRunner::new(
            ctx,
            leader.clone(),
            relay,
            SingleStreamRunnerOptions::new("outbox_channel"),
        );

        runner.stop();
        runner.start().await.unwrap();

        assert_eq!(runner.state().await, LifecycleState::Stopped);
        // leadership was never acquired, so the mutex is still free
        assert!(leader.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn multi_runner_stop_before_start_skips_leadership() {
        let ctx = test_ctx();
        let leader: Arc<dyn distributed_lock::StaticMutex> = Arc::new(InMemoryStaticMutex::new());
        let mut relays = std::collections::HashMap::new();
        relays.insert(
            "stream-a".to_string(),
            Arc::new(OutboxRelay::new(Arc::new(EmptyRepository), Arc::new(NoopDispatcher))),
        );
        let runner = MultiStreamRunner::new(
            ctx,
            leader,
            relays,
            MultiStreamRunnerOptions::new("outbox_channel"),
        );

        runner.stop();
        runner.start().await.unwrap();

        assert_eq!(runner.state().await, LifecycleState::Stopped);
    }

    #[test]
    fn relay_error_surfaces_as_runner_error() {
        let err: RunnerError = OutboxError::DispatchFailed("down".into()).into();
        assert!(matches!(err, RunnerError::Relay(_)));
    }
}
