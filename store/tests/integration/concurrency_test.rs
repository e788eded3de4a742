use std::time::Duration;

use berth_config::{LockStrategy, SessionConfig};
use berth_store::{DbPool, Error, MIGRATOR, SessionStore};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

use super::{session_count, stored_record, test_store};

/// The default test pool is too small for a crowd of cycles that each pin
/// their own connection.
async fn connect_big_pool(pool_opts: MySqlPoolOptions, conn_opts: MySqlConnectOptions) -> DbPool {
    pool_opts
        .max_connections(12)
        .connect_with(conn_opts)
        .await
        .expect("failed to connect test pool")
}

/// Runs `tasks` concurrent workers that each repeatedly read the counter
/// stored under `id`, add one and write it back, one request cycle per
/// increment. Any lost update shows up as a low final count.
async fn run_increments(store: &SessionStore, id: &'static str, tasks: usize, per_task: usize) {
    let mut handles = Vec::new();
    for _ in 0..tasks {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                let mut cycle = store.open();
                let data = cycle.fetch(id).await.expect("fetch failed");
                let count: u64 = String::from_utf8(data)
                    .expect("counter payload should be utf8")
                    .parse()
                    .unwrap_or(0);
                cycle
                    .persist(id, (count + 1).to_string().as_bytes())
                    .await
                    .expect("persist failed");
                cycle.finalize().await.expect("finalize failed");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("increment task panicked");
    }
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn concurrent_first_fetchers_create_exactly_one_row(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = test_store(&pool, LockStrategy::Transactional);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut cycle = store.open();
            let data = cycle.fetch("fresh-id").await.expect("racing fetch failed");
            cycle.finalize().await.expect("finalize failed");
            data
        }));
    }

    for handle in handles {
        let data = handle.await.expect("fetcher task panicked");
        assert!(
            data.is_empty(),
            "nobody persisted, every fetch should see empty data"
        );
    }

    assert_eq!(
        session_count(&pool).await,
        1,
        "the create race left more than one row"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn row_locks_serialize_read_modify_write_cycles(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = test_store(&pool, LockStrategy::Transactional);

    run_increments(&store, "counter", 8, 3).await;

    let record = stored_record(&pool, "counter")
        .await
        .expect("counter row missing");
    assert_eq!(
        record.data,
        b"24".to_vec(),
        "lost update: read-modify-write cycles interleaved"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn advisory_locks_serialize_read_modify_write_cycles(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = test_store(&pool, LockStrategy::Advisory);

    run_increments(&store, "counter", 8, 3).await;

    let record = stored_record(&pool, "counter")
        .await
        .expect("counter row missing");
    assert_eq!(
        record.data,
        b"24".to_vec(),
        "lost update: read-modify-write cycles interleaved"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn advisory_lock_timeout_surfaces_as_an_error(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = SessionStore::new(
        pool.clone(),
        &SessionConfig {
            max_lifetime_seconds: 3600,
            lock_strategy: LockStrategy::Advisory,
            lock_timeout_seconds: 1,
        },
    );

    let mut holder = store.open();
    holder.fetch("contended").await.expect("holder fetch failed");

    let mut waiter = store.open();
    let err = waiter
        .fetch("contended")
        .await
        .expect_err("the second fetch should time out while the lock is held");
    assert!(
        matches!(err, Error::LockTimeout(_)),
        "expected a lock timeout, got {err:?}"
    );

    holder.finalize().await.expect("holder finalize failed");

    // the timed-out cycle holds no locks, so finalizing it is still safe
    waiter.finalize().await.expect("waiter finalize failed");

    let mut retry = store.open();
    retry
        .fetch("contended")
        .await
        .expect("fetch after release should succeed");
    retry.finalize().await.expect("finalize failed");
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn row_lock_holds_concurrent_fetchers_until_finalize(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = test_store(&pool, LockStrategy::Transactional);

    let mut cycle = store.open();
    cycle.persist("blocked", b"v0").await.expect("seed failed");
    cycle.finalize().await.expect("finalize failed");

    let mut holder = store.open();
    holder.fetch("blocked").await.expect("holder fetch failed");

    let contender = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut cycle = store.open();
            let data = cycle.fetch("blocked").await.expect("contender fetch failed");
            cycle
                .persist("blocked", b"v2")
                .await
                .expect("contender persist failed");
            cycle.finalize().await.expect("contender finalize failed");
            data
        })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        !contender.is_finished(),
        "the contender should be parked on the row lock"
    );

    holder.persist("blocked", b"v1").await.expect("holder persist failed");
    holder.finalize().await.expect("holder finalize failed");

    let seen = contender.await.expect("contender task panicked");
    assert_eq!(
        seen,
        b"v1".to_vec(),
        "the contender should read the holder's committed value"
    );
    assert_eq!(
        stored_record(&pool, "blocked").await.expect("row missing").data,
        b"v2".to_vec()
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn dropping_a_cycle_mid_flight_frees_its_locks(
    pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let pool = connect_big_pool(pool_opts, conn_opts).await;
    let store = test_store(&pool, LockStrategy::Transactional);

    let mut abandoned = store.open();
    abandoned.fetch("orphan").await.expect("fetch failed");
    drop(abandoned);

    // The dropped cycle's uncommitted insert rolls back when its
    // connection closes, so a new cycle starts from a clean slate instead
    // of waiting out the lock.
    let mut cycle = store.open();
    let data = cycle.fetch("orphan").await.expect("fetch after drop failed");
    cycle
        .persist("orphan", b"recovered")
        .await
        .expect("persist failed");
    cycle.finalize().await.expect("finalize failed");

    assert!(data.is_empty(), "the abandoned insert should have rolled back");
    assert_eq!(
        stored_record(&pool, "orphan").await.expect("row missing").data,
        b"recovered".to_vec()
    );
}
