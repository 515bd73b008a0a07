//! Single-stream relay runner (spec C8): one leader-elected process drives
//! one [`OutboxRelay`], woken by Postgres `NOTIFY` on a single channel with
//! a poll-timer fallback for liveness.

use crate::error::{RunnerError, RunnerResult};
use crate::lifecycle::LifecycleState;
use crate::metrics::RunnerMetrics;
use db_context::ConnectionContext;
use distributed_lock::{InMemoryStaticMutex, StaticMutex};
use sqlx::postgres::PgListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};
use transactional_outbox::OutboxRelay;

#[derive(Debug, Clone)]
pub struct SingleStreamRunnerOptions {
    /// The channel a [`transactional_outbox::NotifyingOutboxRepository`]
    /// publishes to and this runner `LISTEN`s on.
    pub channel_name: String,
    pub batch_size: u32,
    pub commit_size: u32,
    pub poll_interval: Duration,
    pub lock_retry_interval: Duration,
}

impl SingleStreamRunnerOptions {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            batch_size: 100,
            commit_size: 25,
            poll_interval: Duration::from_millis(2500),
            lock_retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Drives one [`OutboxRelay`] to completion for as long as this process
/// holds leadership. Construct with [`SingleStreamRunner::new`], call
/// [`start`](Self::start) and await it (it resolves once `stop()` has
/// fully drained), and call [`stop`](Self::stop) from anywhere to request
/// shutdown.
pub struct SingleStreamRunner {
    ctx: Arc<ConnectionContext>,
    leader: Arc<dyn StaticMutex>,
    relay: Arc<OutboxRelay>,
    options: SingleStreamRunnerOptions,
    state: AsyncMutex<LifecycleState>,
    stop_tx: watch::Sender<bool>,
    process: Notify,
    processing: InMemoryStaticMutex,
    dirty: AtomicBool,
    started: AtomicBool,
    metrics: Option<RunnerMetrics>,
}

impl SingleStreamRunner {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        leader: Arc<dyn StaticMutex>,
        relay: Arc<OutboxRelay>,
        options: SingleStreamRunnerOptions,
    ) -> Arc<Self> {
        Self::new_with_metrics(ctx, leader, relay, options, None)
    }

    pub fn new_with_metrics(
        ctx: Arc<ConnectionContext>,
        leader: Arc<dyn StaticMutex>,
        relay: Arc<OutboxRelay>,
        options: SingleStreamRunnerOptions,
        metrics: Option<RunnerMetrics>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            leader,
            relay,
            options,
            state: AsyncMutex::new(LifecycleState::Idle),
            stop_tx,
            process: Notify::new(),
            processing: InMemoryStaticMutex::new(),
            dirty: AtomicBool::new(false),
            started: AtomicBool::new(false),
            metrics,
        })
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    /// Contend for leadership, then drive the relay until [`stop`](Self::stop)
    /// is called (or either the listener or the relay hits an
    /// unrecoverable error, which this also returns). Idempotent to call
    /// once; a second call returns [`RunnerError::AlreadyStarted`].
    pub async fn start(self: &Arc<Self>) -> RunnerResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyStarted);
        }

        *self.state.lock().await = LifecycleState::Acquiring;
        if !self.acquire_leadership().await? {
            *self.state.lock().await = LifecycleState::Stopped;
            return Ok(());
        }
        if let Some(metrics) = &self.metrics {
            metrics.leader_gauge.set(1);
        }

        *self.state.lock().await = LifecycleState::Listening;
        self.process.notify_one(); // drain whatever is already pending

        let mut listener_task = Box::pin(self.clone().run_listener());
        let mut stop_rx = self.stop_tx.subscribe();
        let run_result = tokio::select! {
            r = &mut listener_task => r,
            r = self.run_loop(&mut stop_rx) => r,
        };

        *self.state.lock().await = LifecycleState::Draining;
        // wait for any in-flight batch to finish, then release it again
        let _ = self.processing.lock(None).await;
        let _ = self.processing.unlock().await;

        if let Err(e) = self.leader.unlock().await {
            warn!(error = %e, "failed to release leader mutex on stop");
        }
        if let Some(metrics) = &self.metrics {
            metrics.leader_gauge.set(0);
        }
        if let Err(e) = self.ctx.flush_shared_context().await {
            warn!(error = %e, "failed to flush connection context on stop");
        }

        *self.state.lock().await = LifecycleState::Stopped;
        run_result
    }

    /// Request a graceful shutdown. Returns immediately; `start()`'s
    /// future resolves once draining completes. A second call is a silent
    /// no-op.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn acquire_leadership(&self) -> RunnerResult<bool> {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                return Ok(false);
            }
            if self.leader.try_lock().await? {
                return Ok(true);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.lock_retry_interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Holds the `LISTEN` connection and wakes the processing loop on
    /// every notification. Returns `Ok(())` only once `stop()` has been
    /// called; any other exit is the listener connection failing, which
    /// terminates the runner.
    async fn run_listener(self: Arc<Self>) -> RunnerResult<()> {
        let mut listener = PgListener::connect_with(self.ctx.pool()).await?;
        listener.listen(&self.options.channel_name).await?;

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                notification = listener.recv() => {
                    notification?;
                    self.process.notify_one();
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_loop(self: &Arc<Self>, stop_rx: &mut watch::Receiver<bool>) -> RunnerResult<()> {
        loop {
            tokio::select! {
                _ = self.process.notified() => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            }
            self.process_batch().await?;
        }
    }

    async fn process_batch(self: &Arc<Self>) -> RunnerResult<()> {
        if !self.processing.try_lock().await? {
            // already mid-batch: remember there is more work and return
            // rather than wait, so a burst of NOTIFYs never queues up
            // redundant concurrent relay_batch calls.
            self.dirty.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let result = self
            .relay
            .relay_batch(self.options.batch_size, self.options.commit_size)
            .await;
        self.processing.unlock().await?;

        let dispatched = result?;
        if dispatched > 0 {
            info!(dispatched, "outbox runner dispatched a batch");
            if let Some(metrics) = &self.metrics {
                metrics.batches_total.inc();
            }
        }
        if dispatched > 0 || self.dirty.swap(false, Ordering::SeqCst) {
            self.process.notify_one();
        }
        Ok(())
    }
}
