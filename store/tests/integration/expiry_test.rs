use std::time::Duration;

use berth_config::LockStrategy;
use berth_store::{DbPool, MIGRATOR, SessionRecord};
use fake::{Fake, Faker};

use super::{insert_record, session_count, stored_record, test_store, unix_now};

#[sqlx::test(migrator = "MIGRATOR")]
async fn expired_row_reads_as_empty_but_stays_in_place(pool: DbPool) {
    let store = test_store(&pool, LockStrategy::Transactional);
    insert_record(&pool, "stale", unix_now() - 120, b"old state").await;

    let mut cycle = store.open();
    let data = cycle.fetch("stale").await.expect("fetch failed");
    cycle.finalize().await.expect("finalize failed");

    assert!(data.is_empty(), "an expired session should read as empty");

    let record = stored_record(&pool, "stale")
        .await
        .expect("the expired row was deleted inline");
    assert_eq!(
        record.data,
        b"old state".to_vec(),
        "the expired row should stay untouched until a sweep"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn sweep_removes_expired_rows_and_nothing_else(pool: DbPool) {
    let store = test_store(&pool, LockStrategy::Transactional);

    let mut stale: SessionRecord = Faker.fake();
    stale.expiration = unix_now() - 300;
    insert_record(&pool, &stale.id, stale.expiration, &stale.data).await;
    insert_record(&pool, "live", unix_now() + 3600, b"current").await;

    store.mark_for_collection();
    store.open().finalize().await.expect("finalize failed");

    assert!(
        stored_record(&pool, &stale.id).await.is_none(),
        "the expired row survived the sweep"
    );
    assert!(
        stored_record(&pool, "live").await.is_some(),
        "a live row was collected"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn collection_runs_once_no_matter_how_often_it_was_requested(pool: DbPool) {
    let store = test_store(&pool, LockStrategy::Transactional);
    insert_record(&pool, "first", unix_now() - 300, b"").await;

    store.mark_for_collection();
    store.mark_for_collection();
    store.open().finalize().await.expect("finalize failed");
    assert!(stored_record(&pool, "first").await.is_none());

    // the flag was consumed, so a row expiring afterwards survives
    insert_record(&pool, "second", unix_now() - 300, b"").await;
    store.open().finalize().await.expect("finalize failed");
    assert!(
        stored_record(&pool, "second").await.is_some(),
        "finalize swept without a pending collection request"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn background_collection_sweeps_expired_rows_on_a_period(pool: DbPool) {
    let store = test_store(&pool, LockStrategy::Transactional);
    insert_record(&pool, "stale", unix_now() - 300, b"").await;
    insert_record(&pool, "live", unix_now() + 3600, b"").await;

    let collector = tokio::task::spawn(store.continuously_collect(Duration::from_millis(50)));

    // the first tick fires immediately; a few periods cover scheduling jitter
    tokio::time::sleep(Duration::from_millis(300)).await;
    collector.abort();

    assert!(
        stored_record(&pool, "stale").await.is_none(),
        "the background collector did not sweep the expired row"
    );
    assert!(
        stored_record(&pool, "live").await.is_some(),
        "the background collector swept a live row"
    );
}

#[sqlx::test(migrator = "MIGRATOR")]
async fn sweep_now_reports_how_many_rows_it_removed(pool: DbPool) {
    let store = test_store(&pool, LockStrategy::Transactional);
    insert_record(&pool, "one", unix_now() - 300, b"").await;
    insert_record(&pool, "two", unix_now() - 200, b"").await;
    insert_record(&pool, "live", unix_now() + 3600, b"").await;

    let deleted = store.sweep_now().await.expect("sweep failed");

    assert_eq!(deleted, 2);
    assert_eq!(session_count(&pool).await, 1);
}
