use crate::{KeyedMutex, LockError, LockResult, StaticMutex};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// A single in-process mutex backed by a one-permit semaphore. Waiters
/// queue FIFO (`tokio::sync::Semaphore`'s acquire order).
pub struct InMemoryStaticMutex {
    semaphore: Arc<Semaphore>,
    held: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Default for InMemoryStaticMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStaticMutex {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            held: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StaticMutex for InMemoryStaticMutex {
    async fn try_lock(&self) -> LockResult<bool> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                *self.held.lock().await = Some(permit);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn lock(&self, timeout: Option<Duration>) -> LockResult<()> {
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match timeout {
            Some(duration) => tokio::time::timeout(duration, acquire)
                .await
                .map_err(|_| LockError::LockTimeout)?
                .expect("semaphore is never closed"),
            None => acquire.await.expect("semaphore is never closed"),
        };
        *self.held.lock().await = Some(permit);
        Ok(())
    }

    async fn unlock(&self) -> LockResult<()> {
        self.held
            .lock()
            .await
            .take()
            .ok_or(LockError::NotHeld)
            .map(|_| ())
    }
}

/// A registry of lazily-created [`InMemoryStaticMutex`]es, one per key.
pub struct InMemoryKeyedMutex {
    mutexes: SyncMutex<HashMap<String, Arc<InMemoryStaticMutex>>>,
}

impl Default for InMemoryKeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyedMutex {
    pub fn new() -> Self {
        Self {
            mutexes: SyncMutex::new(HashMap::new()),
        }
    }

    fn mutex_for(&self, key: &str) -> Arc<InMemoryStaticMutex> {
        self.mutexes
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(InMemoryStaticMutex::new()))
            .clone()
    }
}

#[async_trait]
impl KeyedMutex for InMemoryKeyedMutex {
    async fn try_lock(&self, key: &str) -> LockResult<bool> {
        self.mutex_for(key).try_lock().await
    }

    async fn lock(&self, key: &str, timeout: Option<Duration>) -> LockResult<()> {
        self.mutex_for(key).lock(timeout).await
    }

    async fn unlock(&self, key: &str) -> LockResult<()> {
        self.mutex_for(key).unlock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_lock_is_exclusive() {
        let mutex = InMemoryStaticMutex::new();
        assert!(mutex.try_lock().await.unwrap());
        assert!(!mutex.try_lock().await.unwrap());
        mutex.unlock().await.unwrap();
        assert!(mutex.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn unlock_without_holding_errors() {
        let mutex = InMemoryStaticMutex::new();
        assert!(matches!(mutex.unlock().await, Err(LockError::NotHeld)));
    }

    #[tokio::test]
    async fn lock_times_out() {
        let mutex = InMemoryStaticMutex::new();
        mutex.try_lock().await.unwrap();
        let result = mutex.lock(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(LockError::LockTimeout)));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let keyed = InMemoryKeyedMutex::new();
        assert!(keyed.try_lock("a").await.unwrap());
        assert!(keyed.try_lock("b").await.unwrap());
        assert!(!keyed.try_lock("a").await.unwrap());
    }
}
