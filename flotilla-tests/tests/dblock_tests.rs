//! Advisory lock contention against a real PostgreSQL server.
//!
//! Skipped unless `FLOTILLA_TEST_DATABASE_URL` points at a database the
//! tests may connect to.

use flotilla_supervisor::SupervisorError;
use flotilla_supervisor::dblock::DbLocker;
use sqlx::postgres::PgConnectOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TEST_KEY: i64 = 424242;

fn test_database() -> Option<PgConnectOptions> {
    std::env::var("FLOTILLA_TEST_DATABASE_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse().ok())
}

fn locker(key: i64) -> DbLocker {
    DbLocker::new(key).with_retry_delay(Duration::from_millis(100))
}

#[tokio::test]
async fn test_second_session_waits_for_unlock() {
    let Some(url) = test_database() else {
        eprintln!("FLOTILLA_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let cancel = CancellationToken::new();
    let first = locker(TEST_KEY);
    let second = Arc::new(locker(TEST_KEY));

    first.lock(&cancel, &url).await.unwrap();
    assert!(first.is_held().await);

    let waiter = tokio::spawn({
        let second = second.clone();
        let cancel = cancel.clone();
        let url = url.clone();
        async move { second.lock(&cancel, &url).await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!waiter.is_finished());
    assert!(!second.is_held().await);

    first.unlock().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(second.is_held().await);
    second.check(&cancel).await.unwrap();
    second.unlock().await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let Some(url) = test_database() else {
        eprintln!("FLOTILLA_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let holder = locker(TEST_KEY + 1);
    holder.lock(&CancellationToken::new(), &url).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let result = locker(TEST_KEY + 1).lock(&cancel, &url).await;
    assert!(matches!(result, Err(SupervisorError::Cancelled)));

    holder.unlock().await.unwrap();
}

#[tokio::test]
async fn test_check_without_lock_fails() {
    let result = locker(TEST_KEY + 2).check(&CancellationToken::new()).await;
    assert!(result.is_err());
}
