//! Multi-stream relay runner (spec C8): one leader-elected process fans
//! out across several registered outbox streams, each identified by a
//! name, woken by a single central `NOTIFY` channel whose payload names
//! which stream to process.

use crate::error::{RunnerError, RunnerResult};
use crate::lifecycle::LifecycleState;
use crate::metrics::RunnerMetrics;
use db_context::ConnectionContext;
use distributed_lock::{InMemoryKeyedMutex, KeyedMutex, StaticMutex};
use sqlx::postgres::PgListener;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use transactional_outbox::OutboxRelay;

#[derive(Debug, Clone)]
pub struct MultiStreamRunnerOptions {
    /// The single channel every registered stream's notifying repository
    /// shares; its payload is the stream identifier.
    pub channel_name: String,
    pub batch_size: u32,
    pub commit_size: u32,
    pub poll_interval: Duration,
    pub lock_retry_interval: Duration,
}

impl MultiStreamRunnerOptions {
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

/// Drives many [`OutboxRelay`]s, one per registered identifier, under a
/// single leader election and a single `LISTEN` connection. A
/// notification whose payload does not match any registered identifier is
/// logged and dropped.
pub struct MultiStreamRunner {
    ctx: Arc<ConnectionContext>,
    leader: Arc<dyn StaticMutex>,
    relays: HashMap<String, Arc<OutboxRelay>>,
    options: MultiStreamRunnerOptions,
    state: AsyncMutex<LifecycleState>,
    stop_tx: watch::Sender<bool>,
    trigger_tx: mpsc::UnboundedSender<String>,
    trigger_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<String>>>,
    processing: InMemoryKeyedMutex,
    dirty: parking_lot::Mutex<HashSet<String>>,
    started: std::sync::atomic::AtomicBool,
    metrics: Option<RunnerMetrics>,
}

impl MultiStreamRunner {
    pub fn new(
        ctx: Arc<ConnectionContext>,
        leader: Arc<dyn StaticMutex>,
        relays: HashMap<String, Arc<OutboxRelay>>,
        options: MultiStreamRunnerOptions,
    ) -> Arc<Self> {
        Self::new_with_metrics(ctx, leader, relays, options, None)
    }

    pub fn new_with_metrics(
        ctx: Arc<ConnectionContext>,
        leader: Arc<dyn StaticMutex>,
        relays: HashMap<String, Arc<OutboxRelay>>,
        options: MultiStreamRunnerOptions,
        metrics: Option<RunnerMetrics>,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            leader,
            relays,
            options,
            state: AsyncMutex::new(LifecycleState::Idle),
            stop_tx,
            trigger_tx,
            trigger_rx: AsyncMutex::new(Some(trigger_rx)),
            processing: InMemoryKeyedMutex::new(),
            dirty: parking_lot::Mutex::new(HashSet::new()),
            started: std::sync::atomic::AtomicBool::new(false),
            metrics,
        })
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub async fn start(self: &Arc<Self>) -> RunnerResult<()> {
        use std::sync::atomic::Ordering;

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
        for identifier in self.relays.keys() {
            let _ = self.trigger_tx.send(identifier.clone());
        }

        let mut rx = self
            .trigger_rx
            .lock()
            .await
            .take()
            .expect("start() already consumed the trigger receiver");

        let mut listener_task = Box::pin(self.clone().run_listener());
        let mut stop_rx = self.stop_tx.subscribe();
        let run_result = tokio::select! {
            r = &mut listener_task => r,
            r = self.run_loop(&mut rx, &mut stop_rx) => r,
        };

        *self.state.lock().await = LifecycleState::Draining;
        for identifier in self.relays.keys() {
            let _ = self.processing.lock(identifier, None).await;
            let _ = self.processing.unlock(identifier).await;
        }

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

    async fn run_listener(self: Arc<Self>) -> RunnerResult<()> {
        let mut listener = PgListener::connect_with(self.ctx.pool()).await?;
        listener.listen(&self.options.channel_name).await?;

        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                notification = listener.recv() => {
                    let notification = notification?;
                    let identifier = notification.payload();
                    if self.relays.contains_key(identifier) {
                        let _ = self.trigger_tx.send(identifier.to_string());
                    } else {
                        debug!(identifier, "dropping notification for unregistered identifier");
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_loop(
        self: &Arc<Self>,
        rx: &mut mpsc::UnboundedReceiver<String>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> RunnerResult<()> {
        loop {
            tokio::select! {
                identifier = rx.recv() => {
                    match identifier {
                        Some(id) => self.process_batch(&id).await?,
                        None => return Ok(()),
                    }
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {
                    for identifier in self.relays.keys() {
                        let _ = self.trigger_tx.send(identifier.clone());
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn process_batch(self: &Arc<Self>, identifier: &str) -> RunnerResult<()> {
        if !self.processing.try_lock(identifier).await? {
            self.dirty.lock().insert(identifier.to_string());
            return Ok(());
        }

        let relay = self
            .relays
            .get(identifier)
            .expect("process_batch is only called for registered identifiers");
        let result = relay
            .relay_batch(self.options.batch_size, self.options.commit_size)
            .await;
        self.processing.unlock(identifier).await?;

        let dispatched = result?;
        if dispatched > 0 {
            info!(identifier, dispatched, "outbox runner dispatched a batch");
            if let Some(metrics) = &self.metrics {
                metrics.batches_total.inc();
            }
        }
        let was_dirty = self.dirty.lock().remove(identifier);
        if dispatched > 0 || was_dirty {
            let _ = self.trigger_tx.send(identifier.to_string());
        }
        Ok(())
    }
}
