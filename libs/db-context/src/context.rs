use crate::connection::ClaimedConnection;
use crate::error::{DbContextError, DbContextResult};
use crate::options::ConnectionContextOptions;
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// The shape every connection-consuming closure passed to this context
/// must take: borrows the connection for exactly the closure's own
/// duration, so the closure's future cannot outlive the borrow.
pub type WithConn<'c, T> = BoxFuture<'c, DbContextResult<T>>;

/// A token identifying one open transaction within a [`ConnectionContext`].
///
/// Opaque by design: the only thing a caller can do with it is pass it back
/// to `commit`/`rollback`/`with_transaction` on the same context, which
/// checks it against the context's current transaction generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    id: u64,
}

struct FreelistEntry {
    id: u64,
    conn: PoolConnection<Postgres>,
}

struct TransactionState {
    id: u64,
    conn: PoolConnection<Postgres>,
    /// Whether this connection was the context's primary before `begin`
    /// borrowed it; if so it is restored to `primary` on finalize instead
    /// of going through the ordinary release path.
    was_primary: bool,
}

#[derive(Default)]
struct ContextState {
    primary: Option<PoolConnection<Postgres>>,
    freelist: Vec<FreelistEntry>,
    transaction: Option<TransactionState>,
    next_freelist_id: u64,
    next_tx_id: u64,
}

/// Routes workload connections for one logical unit of work: a primary
/// connection for read-your-writes consistency across non-transactional
/// queries, a freelist of warm claimed connections, and at most one open
/// transaction at a time.
///
/// All structural transitions — claiming, releasing, beginning, finalizing
/// a transaction — serialize on a single internal mutex, so concurrent
/// tasks sharing one context can never race each other into an
/// inconsistent primary/freelist/transaction assignment. That mutex is
/// held for the duration of `with_transaction`'s callback too: a context
/// models one logical connection identity, so two transactions "at once"
/// in the same context would not be meaningful anyway.
pub struct ConnectionContext {
    pool: PgPool,
    options: ConnectionContextOptions,
    state: AsyncMutex<ContextState>,
}

impl ConnectionContext {
    pub fn new(pool: PgPool, options: ConnectionContextOptions) -> Arc<Self> {
        Arc::new(Self {
            pool,
            options,
            state: AsyncMutex::new(ContextState::default()),
        })
    }

    /// The underlying pool. For callers that need a connection this
    /// context's own claim/release/freelist bookkeeping must not manage —
    /// chiefly a dedicated `LISTEN` connection via `sqlx::postgres::PgListener`,
    /// which has to outlive any single claim and must never be recycled
    /// into the freelist.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` against the context's cached primary connection, claiming
    /// one first if none is cached yet. The primary connection lives for
    /// the lifetime of the context (or until `flush_shared_context`),
    /// rather than being claimed and released per call.
    pub async fn primary<F, T>(self: &Arc<Self>, f: F) -> DbContextResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> WithConn<'c, T>,
    {
        let mut state = self.state.lock().await;
        if state.primary.is_none() {
            drop(state);
            let claimed = self.claim().await?;
            state = self.state.lock().await;
            state.primary = Some(claimed.into_inner());
        }
        let conn = state.primary.as_mut().expect("primary just populated");
        f(&mut **conn).await
    }

    /// Route `f` to the correct connection per the context's responsibility
    /// (spec §4.3): the open transaction's connection if there is one, else
    /// the cached primary if one already exists, else a fresh claim that is
    /// released (with `f`'s error, if any) once `f` returns. Unlike
    /// `primary`, this never *creates* a cached primary as a side effect.
    pub async fn with_connection<F, T>(self: &Arc<Self>, f: F) -> DbContextResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> WithConn<'c, T>,
    {
        if let Some(handle) = self.current_transaction_handle().await {
            return self.with_transaction(handle, f).await;
        }
        if self.state.lock().await.primary.is_some() {
            return self.primary(f).await;
        }
        let mut claimed = self.claim().await?;
        let result = f(claimed.as_mut()).await;
        let err = result.as_ref().err().map(|e| e.to_string());
        self.release(claimed, err).await?;
        result
    }

    /// Claim a connection: pop one off the freelist if available, else
    /// acquire a fresh one from the pool and run `on_claim`.
    pub async fn claim(self: &Arc<Self>) -> DbContextResult<ClaimedConnection> {
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.freelist.pop() {
                debug!(freelist_id = entry.id, "reusing freelisted connection");
                return Ok(ClaimedConnection::new(entry.conn));
            }
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DbContextError::UnableToClaim(e.to_string()))?;
        if let Some(hook) = self.options.on_claim.clone() {
            if let Err(e) = hook.on_claim(&mut *conn).await {
                return Err(DbContextError::UnableToClaim(e.to_string()));
            }
        }
        Ok(ClaimedConnection::new(conn))
    }

    /// Claim a connection bypassing the freelist entirely: always a fresh
    /// acquire from the pool, optionally followed by `fresh_reset_query`.
    pub async fn claim_fresh(self: &Arc<Self>) -> DbContextResult<ClaimedConnection> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DbContextError::UnableToClaim(e.to_string()))?;
        if let Some(reset) = &self.options.fresh_reset_query {
            sqlx::query(reset)
                .execute(&mut *conn)
                .await
                .map_err(|e| DbContextError::UnableToClaim(e.to_string()))?;
        }
        Ok(ClaimedConnection::new(conn))
    }

    /// Release a claimed connection back to the context. If `err` is
    /// `None` and the freelist has room, the connection is kept warm
    /// (subject to `max_idle` eviction); otherwise it goes through
    /// `do_release` (hooks, then back to the pool).
    pub async fn release(
        self: &Arc<Self>,
        claimed: ClaimedConnection,
        err: Option<String>,
    ) -> DbContextResult<()> {
        let conn = claimed.into_inner();
        let mut state = self.state.lock().await;
        if err.is_none() && state.freelist.len() < self.options.keep_connections {
            let id = state.next_freelist_id;
            state.next_freelist_id += 1;
            state.freelist.push(FreelistEntry { id, conn });
            drop(state);
            self.spawn_idle_eviction(id);
            return Ok(());
        }
        drop(state);
        self.do_release(conn, err).await
    }

    /// Begin a transaction: reuses the cached primary connection if one
    /// exists, otherwise claims a fresh one. Errors if a transaction is
    /// already open in this context — transactions do not nest; see
    /// `run_in_transaction` for nesting-safe callers.
    pub async fn begin(self: &Arc<Self>, query: Option<&str>) -> DbContextResult<TransactionHandle> {
        let mut state = self.state.lock().await;
        if state.transaction.is_some() {
            return Err(DbContextError::AlreadyInTransaction);
        }
        let (mut conn, was_primary) = if let Some(primary) = state.primary.take() {
            (primary, true)
        } else {
            drop(state);
            let claimed = self.claim().await?;
            state = self.state.lock().await;
            (claimed.into_inner(), false)
        };

        let begin_sql = query.unwrap_or("BEGIN");
        if let Err(e) = sqlx::query(begin_sql).execute(&mut *conn).await {
            drop(state);
            self.hard_drop(conn).await;
            return Err(DbContextError::Database(e));
        }

        let id = state.next_tx_id;
        state.next_tx_id += 1;
        state.transaction = Some(TransactionState {
            id,
            conn,
            was_primary,
        });
        Ok(TransactionHandle { id })
    }

    /// Whether this context currently has an open transaction.
    pub async fn in_transaction(self: &Arc<Self>) -> bool {
        self.state.lock().await.transaction.is_some()
    }

    async fn current_transaction_handle(self: &Arc<Self>) -> Option<TransactionHandle> {
        self.state
            .lock()
            .await
            .transaction
            .as_ref()
            .map(|t| TransactionHandle { id: t.id })
    }

    /// Run `f` against the transaction's connection. Holds the context
    /// mutex for the duration of `f` — see the type-level doc comment.
    pub async fn with_transaction<F, T>(
        self: &Arc<Self>,
        handle: TransactionHandle,
        f: F,
    ) -> DbContextResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> WithConn<'c, T>,
    {
        let mut state = self.state.lock().await;
        let tx = state
            .transaction
            .as_mut()
            .filter(|t| t.id == handle.id)
            .ok_or(DbContextError::TransactionMismatch)?;
        f(&mut *tx.conn).await
    }

    /// Commit the transaction identified by `handle`.
    pub async fn commit(self: &Arc<Self>, handle: TransactionHandle) -> DbContextResult<()> {
        self.finalize(handle, "COMMIT").await
    }

    /// Roll back the transaction identified by `handle`.
    pub async fn rollback(self: &Arc<Self>, handle: TransactionHandle) -> DbContextResult<()> {
        self.finalize(handle, "ROLLBACK").await
    }

    async fn finalize(self: &Arc<Self>, handle: TransactionHandle, sql: &str) -> DbContextResult<()> {
        let mut state = self.state.lock().await;
        let tx = match state.transaction.take() {
            Some(tx) if tx.id == handle.id => tx,
            Some(other) => {
                state.transaction = Some(other);
                return Err(DbContextError::TransactionMismatch);
            }
            None => return Err(DbContextError::NoActiveTransaction),
        };
        drop(state);

        let TransactionState {
            mut conn,
            was_primary,
            ..
        } = tx;
        match sqlx::query(sql).execute(&mut *conn).await {
            Ok(_) if was_primary => {
                let mut state = self.state.lock().await;
                state.primary = Some(conn);
                Ok(())
            }
            Ok(_) => self.do_release(conn, None).await,
            Err(e) => {
                self.hard_drop(conn).await;
                Err(DbContextError::Database(e))
            }
        }
    }

    /// Run `f` inside a transaction. If this context is already inside one
    /// (e.g. an outer caller already called `run_in_transaction`), `f`
    /// joins it directly with no nested `BEGIN`/`COMMIT`; otherwise one is
    /// opened for the duration of `f` and committed on success, rolled
    /// back and the original error rethrown on failure.
    pub async fn run_in_transaction<F, T>(self: &Arc<Self>, f: F) -> DbContextResult<T>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> WithConn<'c, T>,
    {
        if let Some(handle) = self.current_transaction_handle().await {
            return self.with_transaction(handle, f).await;
        }

        let handle = self.begin(None).await?;
        match self.with_transaction(handle, f).await {
            Ok(value) => {
                self.commit(handle).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(handle).await {
                    tracing::warn!(
                        error = %rollback_err,
                        "rollback after failed run_in_transaction body also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Release every connection this context is holding: the freelist,
    /// then the primary. Errors if a transaction is still open — the
    /// caller must commit or roll it back first.
    pub async fn flush_shared_context(self: &Arc<Self>) -> DbContextResult<()> {
        let mut state = self.state.lock().await;
        if state.transaction.is_some() {
            return Err(DbContextError::DanglingTransaction);
        }
        let freelist = std::mem::take(&mut state.freelist);
        let primary = state.primary.take();
        drop(state);

        for entry in freelist {
            self.do_release(entry.conn, None).await?;
        }
        if let Some(conn) = primary {
            self.do_release(conn, None).await?;
        }
        Ok(())
    }

    async fn do_release(
        self: &Arc<Self>,
        mut conn: PoolConnection<Postgres>,
        err: Option<String>,
    ) -> DbContextResult<()> {
        let run_hook = err.is_none() || self.options.release_hook_on_error;
        if run_hook {
            if let Some(hook) = self.options.on_release.clone() {
                if let Err(e) = hook.on_release(&mut *conn, err.as_deref()).await {
                    return Err(DbContextError::UnableToRelease(e.to_string()));
                }
            }
        }
        drop(conn);
        Ok(())
    }

    async fn hard_drop(self: &Arc<Self>, conn: PoolConnection<Postgres>) {
        drop(conn);
    }

    fn spawn_idle_eviction(self: &Arc<Self>, id: u64) {
        let ctx = Arc::clone(self);
        let max_idle = ctx.options.max_idle;
        tokio::spawn(async move {
            tokio::time::sleep(max_idle).await;
            let mut state = ctx.state.lock().await;
            if let Some(pos) = state.freelist.iter().position(|e| e.id == id) {
                let entry = state.freelist.remove(pos);
                drop(state);
                drop(entry.conn);
                debug!(freelist_id = id, "evicted idle freelisted connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `connect_lazy` never opens a socket until a connection is actually
    // used, so these exercise the context's local bookkeeping without a
    // live database.
    fn fresh_context() -> Arc<ConnectionContext> {
        let pool = PgPool::connect_lazy("postgresql://localhost/test").expect("lazy pool");
        ConnectionContext::new(pool, ConnectionContextOptions::default())
    }

    #[tokio::test]
    async fn new_context_has_no_transaction() {
        let ctx = fresh_context();
        assert!(!ctx.in_transaction().await);
    }

    #[tokio::test]
    async fn flush_on_an_untouched_context_is_a_no_op() {
        let ctx = fresh_context();
        ctx.flush_shared_context().await.unwrap();
    }

    #[tokio::test]
    async fn commit_without_a_matching_transaction_errors() {
        let ctx = fresh_context();
        let stale = TransactionHandle { id: 0 };
        let err = ctx.commit(stale).await.unwrap_err();
        assert!(matches!(err, DbContextError::NoActiveTransaction));
    }

    #[tokio::test]
    async fn with_transaction_without_begin_errors() {
        let ctx = fresh_context();
        let stale = TransactionHandle { id: 0 };
        let err = ctx
            .with_transaction(stale, |_conn| Box::pin(async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, DbContextError::TransactionMismatch));
    }
}
