use std::collections::VecDeque;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Executor as _, MySql};

use crate::Error;

/// MySQL rejects `GET_LOCK` names longer than 64 characters.
const MAX_LOCK_NAME_LEN: usize = 64;

/// Per-cycle connection state manipulated by the concurrency strategies.
///
/// A request cycle pins one pool connection for its whole lifetime; row
/// locks and advisory locks are both scoped to that connection, so handing
/// queries to a different connection would silently drop the serialization
/// guarantee.
pub(crate) struct CycleState {
    pub(crate) conn: Option<PoolConnection<MySql>>,
    /// Whether this connection currently has an open transaction that was
    /// started with a raw `BEGIN`.
    pub(crate) in_tx: bool,
    /// Advisory locks taken during this cycle, released in acquisition order.
    pub(crate) pending_unlocks: VecDeque<String>,
}

impl CycleState {
    pub(crate) fn new(conn: PoolConnection<MySql>) -> Self {
        Self {
            conn: Some(conn),
            in_tx: false,
            pending_unlocks: VecDeque::new(),
        }
    }

    pub(crate) fn conn(&mut self) -> Result<&mut PoolConnection<MySql>, Error> {
        self.conn.as_mut().ok_or(Error::CycleClosed)
    }

    /// Rolls back the open transaction, if any. Used on query failures so
    /// the connection is clean before the error surfaces to the caller.
    pub(crate) async fn rollback(&mut self) -> Result<(), Error> {
        if self.in_tx {
            let conn = self.conn()?;
            (&mut **conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
            self.in_tx = false;
        }
        Ok(())
    }
}

/// How a request cycle serializes itself against other cycles working on
/// the same session id.
///
/// The strategy is picked once when the store is built (from
/// [`berth_config::SessionConfig::lock_strategy`]) and shared by all
/// cycles; anything per-cycle lives in [`CycleState`].
#[async_trait]
pub(crate) trait ConcurrencyStrategy: Send + Sync {
    /// Takes the per-session exclusion before the record is read. Ordering
    /// of concurrent callers is decided by the database, not by us.
    async fn acquire(&self, state: &mut CycleState, id: &str) -> Result<(), Error>;

    /// Releases whatever [`Self::acquire`] took, making buffered writes
    /// visible to the next cycle in line.
    async fn release(&self, state: &mut CycleState) -> Result<(), Error>;

    /// Whether record reads under this strategy must take row locks
    /// (`SELECT ... FOR UPDATE`).
    fn locks_rows(&self) -> bool;
}

/// Serializes cycles with a real transaction and `SELECT ... FOR UPDATE`
/// row locks.
pub(crate) struct Transactional;

#[async_trait]
impl ConcurrencyStrategy for Transactional {
    async fn acquire(&self, state: &mut CycleState, _id: &str) -> Result<(), Error> {
        // A repeated fetch within one cycle keeps working inside the
        // transaction that is already open.
        if state.in_tx {
            return Ok(());
        }

        let conn = state.conn()?;

        // READ COMMITTED keeps the row lock from escalating into the gap
        // locks that MySQL's default isolation level takes, which deadlock
        // concurrent first-time fetches of neighboring ids. The statement
        // scopes to the next transaction only and must run before BEGIN.
        (&mut **conn)
            .execute(sqlx::raw_sql("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"))
            .await?;
        // BEGIN is not supported by the prepared statement protocol, so it
        // goes over the text protocol like the other control statements.
        (&mut **conn).execute(sqlx::raw_sql("BEGIN")).await?;
        state.in_tx = true;

        Ok(())
    }

    async fn release(&self, state: &mut CycleState) -> Result<(), Error> {
        if state.in_tx {
            let conn = state.conn()?;
            (&mut **conn).execute(sqlx::raw_sql("COMMIT")).await?;
            state.in_tx = false;
        }
        Ok(())
    }

    fn locks_rows(&self) -> bool {
        true
    }
}

/// Serializes cycles with a named server-side lock (`GET_LOCK`) instead of
/// a transaction. Writes become visible as soon as each statement runs.
pub(crate) struct AdvisoryLock {
    /// Seconds to wait for the lock before giving up.
    pub(crate) timeout: u64,
}

#[async_trait]
impl ConcurrencyStrategy for AdvisoryLock {
    async fn acquire(&self, state: &mut CycleState, id: &str) -> Result<(), Error> {
        if id.len() > MAX_LOCK_NAME_LEN {
            return Err(Error::LockName(id.to_string()));
        }

        let conn = state.conn()?;
        let granted: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(id)
            .bind(self.timeout)
            .fetch_one(&mut **conn)
            .await?;

        // GET_LOCK returns 1 when granted, 0 on timeout and NULL when the
        // server could not take the lock at all. Locks are reentrant per
        // connection, so a repeated fetch stacks another release.
        match granted {
            Some(1) => {
                state.pending_unlocks.push_back(id.to_string());
                Ok(())
            }
            Some(_) => Err(Error::LockTimeout(id.to_string())),
            None => Err(Error::LockDenied(id.to_string())),
        }
    }

    async fn release(&self, state: &mut CycleState) -> Result<(), Error> {
        // Keys stay queued until the server has confirmed their release;
        // the cycle's drop handling discards the connection if any are left.
        while let Some(key) = state.pending_unlocks.front().cloned() {
            let conn = state.conn()?;
            sqlx::query("DO RELEASE_LOCK(?)")
                .bind(&key)
                .execute(&mut **conn)
                .await?;
            state.pending_unlocks.pop_front();
        }
        Ok(())
    }

    fn locks_rows(&self) -> bool {
        false
    }
}
