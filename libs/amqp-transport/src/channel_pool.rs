//! A bounded pool of confirm-mode channels over one AMQP connection (spec
//! C9's channel pool): leased up to a timeout, evicted and replaced
//! lazily once the broker closes them.

use crate::connection::AmqpConnectionProvider;
use crate::error::{AmqpError, AmqpResult};
use lapin::options::ConfirmSelectOptions;
use lapin::Channel;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy)]
pub struct ChannelPoolOptions {
    /// Channels opened eagerly at construction.
    pub min: usize,
    /// Hard cap on channels leased out at once.
    pub max: usize,
}

impl Default for ChannelPoolOptions {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

pub struct ChannelPool {
    provider: Arc<AmqpConnectionProvider>,
    connection_name: Option<String>,
    idle: Mutex<VecDeque<Channel>>,
    leased: Mutex<HashSet<u16>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl ChannelPool {
    pub async fn new(
        provider: Arc<AmqpConnectionProvider>,
        connection_name: Option<String>,
        options: ChannelPoolOptions,
    ) -> AmqpResult<Arc<Self>> {
        let pool = Arc::new(Self {
            provider,
            connection_name,
            idle: Mutex::new(VecDeque::new()),
            leased: Mutex::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(options.max)),
            closed: AtomicBool::new(false),
        });
        for _ in 0..options.min {
            let ch = pool.open_channel().await?;
            pool.idle.lock().await.push_back(ch);
        }
        Ok(pool)
    }

    async fn open_channel(&self) -> AmqpResult<Channel> {
        let conn = self.provider.connection(self.connection_name.as_deref()).await?;
        let channel = conn.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(channel)
    }

    /// Lease a channel, waiting up to `timeout` if the pool is already at
    /// `max` (`None` waits indefinitely).
    pub async fn channel(self: &Arc<Self>, timeout: Option<Duration>) -> AmqpResult<PooledChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::PoolClosed);
        }

        let acquire = self.permits.clone().acquire_owned();
        let permit = match timeout {
            Some(d) => tokio::time::timeout(d, acquire)
                .await
                .map_err(|_| AmqpError::Timeout)?
                .expect("semaphore is never closed"),
            None => acquire.await.expect("semaphore is never closed"),
        };

        let channel = loop {
            let next = self.idle.lock().await.pop_front();
            match next {
                Some(ch) if ch.status().connected() => break ch,
                Some(_) => continue, // dead channel, evict and try the next one
                None => break self.open_channel().await?,
            }
        };
        self.leased.lock().await.insert(channel.id());

        Ok(PooledChannel {
            pool: Arc::clone(self),
            channel: Some(channel),
            permit: Some(permit),
        })
    }

    /// Return `channel` to the pool. Errors with
    /// [`AmqpError::ChannelNotLeased`] if this pool did not hand it out
    /// (or it was already returned). Leasing a [`PooledChannel`] and
    /// letting it drop calls this automatically; this exists for callers
    /// that need to confirm the return succeeded.
    pub async fn release(self: &Arc<Self>, channel: Channel) -> AmqpResult<()> {
        if !self.leased.lock().await.remove(&channel.id()) {
            return Err(AmqpError::ChannelNotLeased);
        }
        if channel.status().connected() && !self.closed.load(Ordering::SeqCst) {
            self.idle.lock().await.push_back(channel);
        }
        Ok(())
    }

    pub async fn close(self: &Arc<Self>) {
        self.closed.store(true, Ordering::SeqCst);
        let mut idle = self.idle.lock().await;
        for ch in idle.drain(..) {
            let _ = ch.close(200, "pool closing").await;
        }
    }
}

/// A channel leased from a [`ChannelPool`]. Returns itself to the pool on
/// drop; call [`release`](Self::release) to do so eagerly and observe
/// whether it succeeded.
pub struct PooledChannel {
    pool: Arc<ChannelPool>,
    channel: Option<Channel>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledChannel {
    pub async fn release(mut self) -> AmqpResult<()> {
        let channel = self.channel.take().expect("release called twice");
        self.pool.release(channel).await
    }
}

impl std::ops::Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        self.channel.as_ref().expect("PooledChannel used after release")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let pool = Arc::clone(&self.pool);
            let permit = self.permit.take();
            tokio::spawn(async move {
                let _ = pool.release(channel).await;
                drop(permit);
            });
        }
    }
}
