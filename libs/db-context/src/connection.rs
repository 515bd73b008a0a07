use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};
use tracing::warn;

/// A connection claimed from a [`crate::ConnectionContext`].
///
/// The only sanctioned way to give this back is `ConnectionContext::release`
/// — it decides whether the connection goes back on the context's freelist
/// or is handed back to the pool (running `on_release` first). Dropping a
/// `ClaimedConnection` without releasing it still returns the underlying
/// connection to the pool (sqlx's own `Drop` impl takes care of that), but
/// skips the context's bookkeeping and hooks entirely, so it is logged as a
/// leak rather than treated as a normal release path.
pub struct ClaimedConnection {
    inner: Option<PoolConnection<Postgres>>,
}

impl ClaimedConnection {
    pub(crate) fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { inner: Some(conn) }
    }

    /// Borrow the underlying connection to run queries against it.
    ///
    /// Panics if called after the connection has already been released —
    /// that should not be reachable since `release` consumes `self`.
    pub fn as_mut(&mut self) -> &mut PgConnection {
        &mut **self
            .inner
            .as_mut()
            .expect("ClaimedConnection used after release")
    }

    pub(crate) fn into_inner(mut self) -> PoolConnection<Postgres> {
        self.inner.take().expect("ClaimedConnection double-taken")
    }
}

impl Drop for ClaimedConnection {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!(
                "ClaimedConnection dropped without calling ConnectionContext::release; \
                 the connection returns to the pool but skipped release hooks and \
                 freelist bookkeeping"
            );
        }
    }
}
