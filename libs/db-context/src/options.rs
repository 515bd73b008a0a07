use crate::error::DbContextResult;
use async_trait::async_trait;
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;

/// Runs once, immediately after a connection is claimed from the pool (not
/// on a freelist reuse — the whole point of the freelist is to skip this
/// for warm connections). Typical use: `SET app.tenant_id = ...`.
#[async_trait]
pub trait ClaimHook: Send + Sync {
    async fn on_claim(&self, conn: &mut PgConnection) -> DbContextResult<()>;
}

/// Runs before a connection is handed back to the pool. `err` is the error
/// the caller passed to `release`, if any; whether this still runs on an
/// error path is governed by [`ConnectionContextOptions::release_hook_on_error`].
#[async_trait]
pub trait ReleaseHook: Send + Sync {
    async fn on_release(
        &self,
        conn: &mut PgConnection,
        err: Option<&str>,
    ) -> DbContextResult<()>;
}

/// Tuning knobs for a [`crate::ConnectionContext`].
#[derive(Clone)]
pub struct ConnectionContextOptions {
    /// Maximum number of claimed connections kept warm on the context's
    /// freelist instead of being returned to the pool on release.
    pub keep_connections: usize,
    /// How long a freelisted connection may sit idle before it is evicted
    /// (returned to the pool without running `on_release`).
    pub max_idle: Duration,
    /// Runs once per fresh claim (not on freelist reuse).
    pub on_claim: Option<Arc<dyn ClaimHook>>,
    /// Runs before a connection leaves the context for good.
    pub on_release: Option<Arc<dyn ReleaseHook>>,
    /// Whether `on_release` still runs when `release` was called with an
    /// error. Default: `true` (errors still get a chance to clean up
    /// session state before the connection returns to the pool).
    pub release_hook_on_error: bool,
    /// Statement run against a connection obtained through `claim_fresh`,
    /// before it is handed to the caller (e.g. `RESET ALL`).
    pub fresh_reset_query: Option<String>,
}

impl Default for ConnectionContextOptions {
    fn default() -> Self {
        Self {
            keep_connections: 2,
            max_idle: Duration::from_secs(30),
            on_claim: None,
            on_release: None,
            release_hook_on_error: true,
            fresh_reset_query: None,
        }
    }
}
