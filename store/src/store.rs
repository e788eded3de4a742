use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use berth_config::{LockStrategy, SessionConfig};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::strategy::{AdvisoryLock, ConcurrencyStrategy, CycleState, Transactional};
use crate::{DbPool, Error, gc, is_duplicate_key, record};

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Database-backed session store.
///
/// One instance serves the whole process. It is cheap to clone and safe to
/// share across tasks; all per-request state lives in the [`SessionCycle`]
/// values it hands out. The concurrency strategy is fixed at construction
/// from [`berth_config::SessionConfig`] and shared by every cycle.
#[derive(Clone)]
pub struct SessionStore {
    pool: DbPool,
    strategy: Arc<dyn ConcurrencyStrategy>,
    max_lifetime: i64,
    gc_requested: Arc<AtomicBool>,
}

impl SessionStore {
    pub fn new(pool: DbPool, config: &SessionConfig) -> Self {
        let strategy: Arc<dyn ConcurrencyStrategy> = match config.lock_strategy {
            LockStrategy::Transactional => Arc::new(Transactional),
            LockStrategy::Advisory => Arc::new(AdvisoryLock {
                timeout: config.lock_timeout_seconds,
            }),
        };

        Self {
            pool,
            strategy,
            max_lifetime: config.max_lifetime_seconds,
            gc_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens a request cycle.
    ///
    /// Performs no I/O; the cycle takes a pool connection lazily on first
    /// use. The expiration that every row written during this cycle will
    /// carry is fixed here, so repeated writes within one request agree
    /// on it.
    pub fn open(&self) -> SessionCycle {
        SessionCycle {
            store: self.clone(),
            state: None,
            expiration: unix_now() + self.max_lifetime,
        }
    }

    /// Requests a garbage sweep from whichever cycle finalizes next.
    /// Performs no I/O itself, and any number of requests collapse into a
    /// single sweep.
    pub fn mark_for_collection(&self) {
        self.gc_requested.store(true, Ordering::Relaxed);
    }

    /// Deletes all expired rows immediately, outside any request cycle.
    /// Returns how many rows were removed.
    pub async fn sweep_now(&self) -> Result<u64, Error> {
        let deleted = gc::sweep_expired(&self.pool, unix_now()).await?;
        debug!(deleted, "swept expired session records");
        Ok(deleted)
    }

    /// Deletes expired rows on a fixed period until the task is dropped.
    /// Meant to be spawned once at startup:
    ///
    /// ```rust,ignore
    /// tokio::task::spawn(store.clone().continuously_collect(Duration::from_secs(60)));
    /// ```
    pub async fn continuously_collect(self, period: Duration) -> Result<(), Error> {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.sweep_now().await?;
        }
    }
}

/// One request's view of the session table.
///
/// A cycle serializes itself against other cycles touching the same session
/// id through the store's configured strategy: fetch acquires, finalize
/// releases. Dropping a cycle that still holds a transaction or advisory
/// locks discards its connection instead of returning it to the pool, so
/// the server rolls the work back and frees the locks.
pub struct SessionCycle {
    store: SessionStore,
    state: Option<CycleState>,
    expiration: i64,
}

impl SessionCycle {
    /// Loads the session payload for `id`, creating the row on first sight.
    ///
    /// Concurrent cycles for the same id queue up here until the current
    /// holder finalizes. An expired row resolves to an empty payload but is
    /// left in place for the next sweep; a missing row is created with an
    /// empty payload. On failure the open transaction is rolled back and
    /// the error surfaces, so the caller can tell a broken store from an
    /// absent session.
    pub async fn fetch(&mut self, id: &str) -> Result<Vec<u8>, Error> {
        match self.fetch_inner(id).await {
            Ok(data) => Ok(data),
            Err(err) => {
                error!(session_id = %id, error = %err, "session fetch failed");
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Writes the payload for `id`, inserting or overwriting as needed.
    ///
    /// Safe to call without a prior [`fetch`](Self::fetch) in the same
    /// cycle; the write is then simply not serialized against other cycles.
    pub async fn persist(&mut self, id: &str, data: &[u8]) -> Result<(), Error> {
        match self.persist_inner(id, data).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(session_id = %id, error = %err, "session persist failed");
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Removes the session row outright, independent of the fetch/persist
    /// sequence. Deleting an id that has no row is not an error.
    pub async fn delete(&mut self, id: &str) -> Result<(), Error> {
        match self.delete_inner(id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(session_id = %id, error = %err, "session delete failed");
                self.abort().await;
                Err(err)
            }
        }
    }

    /// Requests a garbage sweep from the next finalize, this cycle's
    /// included. See [`SessionStore::mark_for_collection`].
    pub fn mark_for_collection(&self) {
        self.store.mark_for_collection();
    }

    /// Ends the cycle: commits or drains queued unlocks, runs the deferred
    /// garbage sweep if one was requested, and returns the connection to
    /// the pool.
    pub async fn finalize(mut self) -> Result<(), Error> {
        let strategy = Arc::clone(&self.store.strategy);

        if let Some(state) = self.state.as_mut() {
            if let Err(err) = strategy.release(state).await {
                error!(error = %err, "failed to release session cycle");
                self.abort().await;
                return Err(err);
            }
        }

        // The sweep is a store-wide operation and must not run under the
        // scope just released, so it only starts after a successful commit
        // or unlock drain.
        if self.store.gc_requested.swap(false, Ordering::Relaxed) {
            if let Err(err) = self.sweep_deferred().await {
                // keep the request alive for the next finalize
                self.store.gc_requested.store(true, Ordering::Relaxed);
                error!(error = %err, "deferred session sweep failed");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn fetch_inner(&mut self, id: &str) -> Result<Vec<u8>, Error> {
        let strategy = Arc::clone(&self.store.strategy);
        let lock_rows = strategy.locks_rows();
        let expiration = self.expiration;

        let state = self.state().await?;
        strategy.acquire(state, id).await?;

        match record::load(id, lock_rows, &mut **state.conn()?).await? {
            Some(record) if !record.is_expired(unix_now()) => Ok(record.data),
            Some(_) => Ok(Vec::new()),
            None => initialize_record(strategy.as_ref(), state, id, expiration, lock_rows).await,
        }
    }

    async fn persist_inner(&mut self, id: &str, data: &[u8]) -> Result<(), Error> {
        let expiration = self.expiration;
        let state = self.state().await?;
        record::upsert(id, expiration, data, &mut **state.conn()?).await
    }

    async fn delete_inner(&mut self, id: &str) -> Result<(), Error> {
        let state = self.state().await?;
        record::delete(id, &mut **state.conn()?).await
    }

    /// Runs the deferred sweep on this cycle's connection, which is out of
    /// any transaction by the time this is called.
    async fn sweep_deferred(&mut self) -> Result<(), Error> {
        let state = self.state().await?;
        let deleted = gc::sweep_expired(&mut **state.conn()?, unix_now()).await?;
        debug!(deleted, "swept expired session records");
        Ok(())
    }

    /// Pins a pool connection to this cycle on first use.
    async fn state(&mut self) -> Result<&mut CycleState, Error> {
        if self.state.is_none() {
            let conn = self.store.pool.acquire().await?;
            self.state = Some(CycleState::new(conn));
        }
        self.state.as_mut().ok_or(Error::CycleClosed)
    }

    /// Best-effort rollback after a failed operation, so the connection is
    /// clean for whatever the caller does next.
    async fn abort(&mut self) {
        if let Some(state) = self.state.as_mut() {
            if let Err(err) = state.rollback().await {
                warn!(error = %err, "rollback after failed session operation also failed");
            }
        }
    }
}

impl Drop for SessionCycle {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Some(conn) = state.conn {
                if state.in_tx || !state.pending_unlocks.is_empty() {
                    // The server rolls back and frees advisory locks when
                    // the connection closes; returning it to the pool would
                    // hand the next request a dirty connection.
                    warn!("session cycle dropped mid-flight, discarding its connection");
                    drop(conn.detach());
                } else {
                    drop(conn);
                }
            }
        }
    }
}

/// First sight of an id: insert the empty row.
///
/// Two concurrent first fetchers can both get here because a row lock
/// cannot cover a row that does not exist yet. The loser of the resulting
/// insert race re-reads under the same locking rules and accepts the
/// winner's row as authoritative; every other failure stays a hard error.
async fn initialize_record(
    strategy: &dyn ConcurrencyStrategy,
    state: &mut CycleState,
    id: &str,
    expiration: i64,
    lock_rows: bool,
) -> Result<Vec<u8>, Error> {
    match record::initialize(id, expiration, &mut **state.conn()?).await {
        Ok(()) => {
            debug!(session_id = %id, "created session record");
            Ok(Vec::new())
        }
        Err(Error::DatabaseError(err)) if is_duplicate_key(&err) => {
            debug!(session_id = %id, "lost session record creation race, re-reading");
            // The failed duplicate check leaves this transaction holding a
            // shared lock on the winner's row. Re-reading FOR UPDATE under
            // that lock deadlocks as soon as two losers collide, so the
            // transaction restarts before the locked re-read.
            if state.in_tx {
                state.rollback().await?;
                strategy.acquire(state, id).await?;
            }
            let record = record::load(id, lock_rows, &mut **state.conn()?).await?;
            Ok(record.map(|record| record.data).unwrap_or_default())
        }
        Err(err) => Err(err),
    }
}
