//! Connection-context runtime: per-unit-of-work routing between a cached
//! primary connection, a warm freelist of claimed connections, and at most
//! one open transaction.
//!
//! A [`ConnectionContext`] wraps a `sqlx::PgPool` and adds the bookkeeping
//! the pool itself does not do: `primary()` caches one connection for
//! read-your-writes consistency across a sequence of non-transactional
//! queries; `claim()`/`release()` keep a small freelist of warm connections
//! to skip repeated claim-hook overhead within one context; `begin()`/
//! `commit()`/`rollback()`/`run_in_transaction()` manage a single
//! in-flight transaction, reusing the primary connection when one is
//! already cached.

mod connection;
mod context;
mod error;
mod options;

pub use connection::ClaimedConnection;
pub use context::{ConnectionContext, TransactionHandle, WithConn};
pub use error::{DbContextError, DbContextResult};
pub use options::{ClaimHook, ConnectionContextOptions, ReleaseHook};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_options_keep_a_small_warm_freelist() {
        let options = ConnectionContextOptions::default();
        assert_eq!(options.keep_connections, 2);
        assert_eq!(options.max_idle, Duration::from_secs(30));
        assert!(options.on_claim.is_none());
        assert!(options.on_release.is_none());
        assert!(options.release_hook_on_error);
    }
}
