//! Static and keyed mutex abstractions, with in-memory and
//! PostgreSQL-advisory-lock backends.
//!
//! A [`StaticMutex`] is a single, exclusive, non-reentrant lock:
//! `try_lock`/`lock`/`unlock`. A [`KeyedMutex`] is the same contract
//! parameterised by a string key — locks on distinct keys never contend.
//!
//! The in-memory backend is for single-process coordination (tests, or a
//! runner's per-identifier processing gate). The PostgreSQL-advisory
//! backend is for cross-process leader election: it maps a key to a
//! 64-bit integer via [`lock_key_for`] and holds a session-scoped advisory
//! lock on a connection dedicated to the mutex (never borrowed from a
//! shared pool), so that an unrelated workload transaction elsewhere can
//! never drop the lock by returning that connection.

mod error;
mod in_memory;
mod pg_advisory;

pub use error::{LockError, LockResult};
pub use in_memory::{InMemoryKeyedMutex, InMemoryStaticMutex};
pub use pg_advisory::{PgAdvisoryKeyedMutex, PgAdvisoryMutex};

use async_trait::async_trait;
use std::time::Duration;

/// An exclusive, non-reentrant, fair-if-possible mutex.
#[async_trait]
pub trait StaticMutex: Send + Sync {
    /// Attempt to acquire without waiting.
    async fn try_lock(&self) -> LockResult<bool>;

    /// Acquire, waiting up to `timeout` if given. `None` waits forever.
    async fn lock(&self, timeout: Option<Duration>) -> LockResult<()>;

    /// Release. Errors if this handle does not currently hold the lock.
    async fn unlock(&self) -> LockResult<()>;
}

/// The same contract as [`StaticMutex`], parameterised by key: locks on
/// distinct keys never contend with each other.
#[async_trait]
pub trait KeyedMutex: Send + Sync {
    async fn try_lock(&self, key: &str) -> LockResult<bool>;
    async fn lock(&self, key: &str, timeout: Option<Duration>) -> LockResult<()>;
    async fn unlock(&self, key: &str) -> LockResult<()>;
}

/// Derive a stable 64-bit advisory-lock key from an arbitrary name.
///
/// PostgreSQL's single-argument `pg_advisory_lock` takes a `bigint`; named
/// locks need a deterministic name-to-integer mapping. CRC32 is wide
/// enough that collisions between the small number of distinct lock names
/// a service declares are not a practical concern, and it is stable across
/// process restarts and platforms (unlike `Hash`/`DefaultHasher`, whose
/// output is not guaranteed stable across Rust versions).
pub fn lock_key_for(name: &str) -> i64 {
    crc32fast::hash(name.as_bytes()) as i64
}
