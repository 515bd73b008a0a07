//! Error types for the outbox relay runners.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// `start()` was called on a runner that has already started (or
    /// finished) once; a runner is not restartable in place.
    #[error("runner already started")]
    AlreadyStarted,

    /// Leader-election mutex acquisition or release failed.
    #[error("leader mutex error: {0}")]
    Lock(#[from] distributed_lock::LockError),

    /// The outbox relay's own batch processing failed.
    #[error("outbox relay error: {0}")]
    Relay(#[from] transactional_outbox::OutboxError),

    /// The `LISTEN` connection failed.
    #[error("listener database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A connection-context routing/lifecycle error surfaced during
    /// shutdown cleanup.
    #[error("connection context error: {0}")]
    Context(#[from] db_context::DbContextError),
}
