//! Error types for the db-context library.

use thiserror::Error;

/// Result type alias for connection-context operations.
pub type DbContextResult<T> = Result<T, DbContextError>;

/// Errors that can occur while routing, claiming, or releasing connections
/// through a [`crate::ConnectionContext`].
#[derive(Error, Debug)]
pub enum DbContextError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// `begin` was called while a transaction is already open in this
    /// context. Transactions do not nest; callers that might already be
    /// inside one should use `run_in_transaction` instead.
    #[error("a transaction is already active in this context")]
    AlreadyInTransaction,

    /// `commit`/`rollback`/`with_transaction` was called with no
    /// transaction open.
    #[error("no active transaction in this context")]
    NoActiveTransaction,

    /// The transaction handle passed to `commit`/`rollback`/
    /// `with_transaction` does not match the context's current
    /// transaction (it was already finalized, or belongs to a stale
    /// generation).
    #[error("transaction handle does not match this context's active transaction")]
    TransactionMismatch,

    /// `flush_shared_context` was called while a transaction was still
    /// open; the caller must commit or roll it back first.
    #[error("flush_shared_context called while a transaction is still open")]
    DanglingTransaction,

    /// Claiming a connection (from the pool, or via `claim_fresh`) failed,
    /// including any `on_claim` hook failure.
    #[error("unable to claim a connection: {0}")]
    UnableToClaim(String),

    /// Running the `on_release` hook, or returning the connection to the
    /// pool, failed.
    #[error("unable to release a connection: {0}")]
    UnableToRelease(String),
}
