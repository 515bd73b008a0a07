//! Error types for the transactional outbox library.

use thiserror::Error;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A connection-context routing/lifecycle error (claim, release,
    /// transaction mismatch, ...).
    #[error("connection context error: {0}")]
    Context(#[from] db_context::DbContextError),

    /// A stored or outgoing envelope failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The downstream dispatcher rejected a batch (spec's `TransientBroker`
    /// / `UnableToDispatchMessages`, surfaced past the relay).
    #[error("downstream dispatch failed: {0}")]
    DispatchFailed(String),

    /// Generic error with context.
    #[error("outbox error: {0}")]
    Other(#[from] anyhow::Error),
}
