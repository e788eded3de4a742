#[cfg(feature = "test-helpers")]
use fake::{Dummy, Fake, faker::lorem::en::Sentence, uuid::UUIDv4};

use serde::{Deserialize, Serialize};
use sqlx::MySql;
use sqlx::prelude::FromRow;

use crate::Error;

/// A session row as stored in the `sessions` table.
///
/// The payload is an opaque byte buffer; encoding and decoding it is the
/// caller's business. `expiration` is an absolute unix timestamp after which
/// the row is considered dead and eligible for collection.
///
/// Records can also be generated as fake data for tests when the
/// `test-helpers` feature is enabled:
///
/// ```rust,ignore
/// let record: SessionRecord = Faker.fake();
/// ```
#[derive(Clone, Serialize, Deserialize, FromRow, Debug)]
#[cfg_attr(feature = "test-helpers", derive(Dummy))]
pub struct SessionRecord {
    /// The session id, unique across the table.
    #[cfg_attr(feature = "test-helpers", dummy(faker = "UUIDv4"))]
    pub id: String,
    /// Unix timestamp after which the record no longer resolves.
    #[cfg_attr(feature = "test-helpers", dummy(faker = "1_700_000_000..1_800_000_000"))]
    pub expiration: i64,
    /// Opaque session payload.
    #[cfg_attr(
        feature = "test-helpers",
        dummy(expr = "Sentence(3..8).fake::<String>().into_bytes()")
    )]
    pub data: Vec<u8>,
}

impl SessionRecord {
    /// Whether the record has outlived its expiration at the given instant.
    ///
    /// A record expiring exactly at `now` still resolves; only strictly
    /// older timestamps count as expired.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration < now
    }
}

/// Loads the record for `id`, optionally taking a row lock so the row stays
/// claimed until the surrounding transaction ends.
pub(crate) async fn load(
    id: &str,
    lock: bool,
    executor: impl sqlx::Executor<'_, Database = MySql>,
) -> Result<Option<SessionRecord>, Error> {
    let sql = if lock {
        "SELECT id, expiration, data FROM sessions WHERE id = ? FOR UPDATE"
    } else {
        "SELECT id, expiration, data FROM sessions WHERE id = ?"
    };

    let record = sqlx::query_as::<_, SessionRecord>(sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(record)
}

/// Inserts the empty row that backs a freshly seen session id.
pub(crate) async fn initialize(
    id: &str,
    expiration: i64,
    executor: impl sqlx::Executor<'_, Database = MySql>,
) -> Result<(), Error> {
    sqlx::query("INSERT INTO sessions (id, expiration, data) VALUES (?, ?, ?)")
        .bind(id)
        .bind(expiration)
        .bind(Vec::<u8>::new())
        .execute(executor)
        .await?;

    Ok(())
}

/// Writes `data` for `id`, creating the row if it is absent and overwriting
/// payload and expiration if it is not. The insert and update halves bind
/// the same values, so the statement behaves identically no matter which
/// one the database picks.
pub(crate) async fn upsert(
    id: &str,
    expiration: i64,
    data: &[u8],
    executor: impl sqlx::Executor<'_, Database = MySql>,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO sessions (id, expiration, data) VALUES (?, ?, ?) \
         ON DUPLICATE KEY UPDATE expiration = ?, data = ?",
    )
    .bind(id)
    .bind(expiration)
    .bind(data)
    .bind(expiration)
    .bind(data)
    .execute(executor)
    .await?;

    Ok(())
}

/// Deletes the row for `id`. Removing an absent row is not an error.
pub(crate) async fn delete(
    id: &str,
    executor: impl sqlx::Executor<'_, Database = MySql>,
) -> Result<(), Error> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;

    Ok(())
}
