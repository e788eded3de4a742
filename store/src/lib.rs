//! Database-backed session storage with per-session locking and deferred
//! garbage collection of expired rows.

use berth_config::DatabaseConfig;
use sqlx::MySql;
use sqlx::migrate::MigrateDatabase as _;
use sqlx::mysql::MySqlPoolOptions;

pub use sqlx::MySqlPool as DbPool;

/// Migrator embedding the `sessions` schema under `store/migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

mod gc;
mod record;
mod store;
mod strategy;

pub use record::SessionRecord;
pub use store::{SessionCycle, SessionStore};

/// Creates a connection pool to the database specified in the passed [`berth_config::DatabaseConfig`].
pub async fn connect_pool(config: &DatabaseConfig) -> Result<DbPool, Error> {
    let pool = MySqlPoolOptions::new().connect(&config.url).await?;

    Ok(pool)
}

/// Create the database if it does not exist.
/// Used for parts of the system where databases are created
/// at runtime, e.g. tests and the `db` CLI.
pub async fn create_database_if_not_exists(config: &DatabaseConfig) -> Result<(), Error> {
    if !MySql::database_exists(&config.url).await? {
        MySql::create_database(&config.url).await?
    };
    Ok(())
}

/// Errors that can occur as a result of a session storage operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The named session lock could not be obtained within the configured
    /// wait. Recoverable: the caller may retry the whole request cycle.
    #[error("timed out waiting for session lock `{0}`")]
    LockTimeout(String),
    /// The backing store refused to grant the named lock for a reason other
    /// than contention (e.g. it is out of memory or the thread was killed).
    #[error("backing store failed to grant session lock `{0}`")]
    LockDenied(String),
    /// Session ids double as lock names under the advisory strategy, and the
    /// backing store caps lock names at 64 characters.
    #[error("session id `{0}` is too long to be used as a lock name")]
    LockName(String),
    /// An operation was invoked on a request cycle whose connection has
    /// already been released or discarded.
    #[error("session request cycle has no active connection")]
    CycleClosed,
    /// General database error, e.g. communicating with the database failed.
    #[error("database query failed")]
    DatabaseError(#[from] sqlx::Error),
}

/// Whether an error is the duplicate-key violation raised when two first
/// fetchers race to insert the same session row. Only this condition
/// triggers the re-read recovery in [`SessionCycle::fetch`]; everything
/// else stays a hard failure.
pub(crate) fn is_duplicate_key(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}
