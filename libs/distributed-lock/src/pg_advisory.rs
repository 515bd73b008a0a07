use crate::{lock_key_for, KeyedMutex, LockError, LockResult, StaticMutex};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A session-scoped PostgreSQL advisory lock on a connection dedicated to
/// this mutex alone.
///
/// The dedicated connection is the "fresh" mode of spec §4.2: advisory
/// locks are tied to the session (connection) that took them, so sharing
/// this connection with pooled workload queries would let an unrelated
/// `release`-to-pool silently drop the lock. `PgAdvisoryMutex::connect`
/// opens its own connection, bypassing any pool, and keeps it for the
/// mutex's entire lifetime.
pub struct PgAdvisoryMutex {
    key: i64,
    conn: Mutex<PgConnection>,
    held: Mutex<bool>,
}

impl PgAdvisoryMutex {
    /// Open a dedicated connection and prepare (but do not yet acquire) an
    /// advisory lock keyed by `lock_name`.
    pub async fn connect(database_url: &str, lock_name: &str) -> LockResult<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self {
            key: lock_key_for(lock_name),
            conn: Mutex::new(conn),
            held: Mutex::new(false),
        })
    }
}

#[async_trait]
impl StaticMutex for PgAdvisoryMutex {
    async fn try_lock(&self) -> LockResult<bool> {
        let mut conn = self.conn.lock().await;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        if locked {
            *self.held.lock().await = true;
            debug!(key = self.key, "advisory lock acquired");
        }
        Ok(locked)
    }

    async fn lock(&self, timeout: Option<Duration>) -> LockResult<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.try_lock().await? {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(LockError::LockTimeout);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self) -> LockResult<()> {
        let mut held = self.held.lock().await;
        if !*held {
            return Err(LockError::NotHeld);
        }
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *conn)
            .await?;
        *held = false;
        debug!(key = self.key, "advisory lock released");
        Ok(())
    }
}

/// A keyed advisory-lock mutex sharing one dedicated session connection.
///
/// A single PostgreSQL session can hold advisory locks on any number of
/// distinct keys at once, so one dedicated connection suffices for all
/// keys this handle ever locks — only the derived integer key, tracked
/// locally, distinguishes them.
pub struct PgAdvisoryKeyedMutex {
    conn: Mutex<PgConnection>,
    held: Mutex<HashSet<i64>>,
}

impl PgAdvisoryKeyedMutex {
    pub async fn connect(database_url: &str) -> LockResult<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self {
            conn: Mutex::new(conn),
            held: Mutex::new(HashSet::new()),
        })
    }
}

#[async_trait]
impl KeyedMutex for PgAdvisoryKeyedMutex {
    async fn try_lock(&self, key: &str) -> LockResult<bool> {
        let derived = lock_key_for(key);
        let mut conn = self.conn.lock().await;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(derived)
            .fetch_one(&mut *conn)
            .await?;
        if locked {
            self.held.lock().await.insert(derived);
        }
        Ok(locked)
    }

    async fn lock(&self, key: &str, timeout: Option<Duration>) -> LockResult<()> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.try_lock(key).await? {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(LockError::LockTimeout);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, key: &str) -> LockResult<()> {
        let derived = lock_key_for(key);
        {
            let mut held = self.held.lock().await;
            if !held.remove(&derived) {
                return Err(LockError::NotHeld);
            }
        }
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(derived)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
