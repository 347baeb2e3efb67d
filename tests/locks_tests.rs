mod support;

use std::time::Duration;

use backplane::error::BackplaneError;
use backplane::locks::Locks;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn try_acquire_is_exclusive() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let locks = Locks::new(pool, support::fast_config());
    locks.init().await.unwrap();

    let id = support::unique("lock");
    locks.try_acquire(&id).await.unwrap();

    let err = locks.try_acquire(&id).await.unwrap_err();
    assert!(matches!(err, BackplaneError::Locked(_)));

    locks.release(&id).await.unwrap();
}

#[tokio::test]
async fn release_allows_reacquisition() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let locks = Locks::new(pool, support::fast_config());
    locks.init().await.unwrap();

    let id = support::unique("lock");
    locks.try_acquire(&id).await.unwrap();
    locks.release(&id).await.unwrap();
    locks.try_acquire(&id).await.unwrap();
    locks.release(&id).await.unwrap();
}

#[tokio::test]
async fn stale_leases_are_taken_over() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let config = support::fast_config();
    let locks = Locks::new(pool, config);
    locks.init().await.unwrap();

    let id = support::unique("lock");
    locks.try_acquire(&id).await.unwrap();

    // No holds: the lease goes stale and a second owner may take over.
    tokio::time::sleep(config.hold_deadline + Duration::from_millis(100)).await;
    locks.try_acquire(&id).await.unwrap();

    locks.release(&id).await.unwrap();
}

#[tokio::test]
async fn hold_keeps_the_lease_fresh() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let config = support::fast_config();
    let locks = Locks::new(pool, config);
    locks.init().await.unwrap();

    let id = support::unique("lock");
    locks.try_acquire(&id).await.unwrap();

    // Renew past the hold deadline; the lock must stay exclusive.
    for _ in 0..3 {
        tokio::time::sleep(config.hold_deadline / 2).await;
        locks.hold(&id).await.unwrap();
    }
    let err = locks.try_acquire(&id).await.unwrap_err();
    assert!(matches!(err, BackplaneError::Locked(_)));

    locks.release(&id).await.unwrap();
}

#[tokio::test]
async fn hold_on_unknown_lock_is_not_found() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let locks = Locks::new(pool, support::fast_config());
    locks.init().await.unwrap();

    let err = locks.hold(&support::unique("lock")).await.unwrap_err();
    assert!(matches!(err, BackplaneError::NotFound(_)));
}

#[tokio::test]
async fn waiters_wake_on_release() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let locks = Locks::new(pool, support::fast_config());
    locks.init().await.unwrap();

    let id = support::unique("lock");
    locks.try_acquire(&id).await.unwrap();

    let waiter_locks = locks.clone();
    let waiter_id = id.clone();
    let cancel = CancellationToken::new();
    let waiter_cancel = cancel.clone();
    let waiter =
        tokio::spawn(async move { waiter_locks.acquire(&waiter_id, waiter_cancel).await });

    // The waiter must block while the lease is fresh.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished(), "acquire returned while lock was held");

    locks.release(&id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("acquire did not wake after release")
        .unwrap()
        .unwrap();

    locks.release(&id).await.unwrap();
    cancel.cancel();
}
