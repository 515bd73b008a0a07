//! Error types for the distributed-lock library.

use thiserror::Error;

/// Result type alias for mutex operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur acquiring or releasing a mutex.
#[derive(Error, Debug)]
pub enum LockError {
    /// `lock(timeout)` elapsed before the mutex was acquired.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// `unlock` was called on a mutex (or key) this handle does not hold.
    #[error("mutex is not held by this handle")]
    NotHeld,

    /// `lock`/`try_lock` was called while this handle already holds the
    /// mutex; non-reentrant.
    #[error("mutex already held by this handle")]
    AlreadyHeld,

    /// The advisory-lock connection failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
