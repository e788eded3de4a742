use sqlx::MySql;

use crate::Error;

/// Deletes every session row whose expiration lies strictly before `now`.
/// Returns the number of rows removed.
///
/// This is the whole garbage collector: a single bulk delete, not keyed by
/// any session id. Must run on a connection that is outside a transaction.
pub(crate) async fn sweep_expired(
    executor: impl sqlx::Executor<'_, Database = MySql>,
    now: i64,
) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expiration < ?")
        .bind(now)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}
