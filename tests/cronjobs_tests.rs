mod support;

use std::collections::HashMap;
use std::time::Duration;

use backplane::cronjobs::{CronJobs, CRONJOB_ID_LABEL, CRONJOB_NAME_LABEL};
use backplane::error::BackplaneError;
use backplane::jobs::Jobs;
use tokio_util::sync::CancellationToken;

fn cores(pool: sqlx::PgPool) -> (Jobs, CronJobs) {
    let config = support::fast_config();
    let jobs = Jobs::new(pool.clone(), config);
    let cronjobs = CronJobs::new(pool, config, jobs.clone());
    (jobs, cronjobs)
}

#[tokio::test]
async fn create_rejects_bad_expressions() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let (jobs, cronjobs) = cores(pool);
    jobs.init().await.unwrap();
    cronjobs.init().await.unwrap();

    let queue = support::unique("cq");
    let err = cronjobs
        .create(&queue, None, "not a cron", b"".to_vec(), HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackplaneError::InvalidArgument(_)));
}

#[tokio::test]
async fn creating_a_schedule_fires_immediately() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let (jobs, cronjobs) = cores(pool);
    jobs.init().await.unwrap();
    cronjobs.init().await.unwrap();

    let queue = support::unique("cq");
    let name = support::unique("nightly");
    let cronjob = cronjobs
        .create(
            &queue,
            Some(name.clone()),
            "@every 1s",
            b"".to_vec(),
            HashMap::new(),
        )
        .await
        .unwrap();

    // The create call materializes due rows itself; give the insert a
    // moment and look for the derived job with the system labels.
    let mut filter = HashMap::new();
    filter.insert(CRONJOB_NAME_LABEL.to_string(), name.clone());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let materialized = loop {
        let found = jobs
            .list(&[queue.clone()], &filter, false)
            .await
            .unwrap();
        if let Some(job) = found.into_iter().next() {
            break job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no job materialized within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(
        materialized.labels.get(CRONJOB_ID_LABEL),
        Some(&cronjob.id.to_string())
    );

    cronjobs.delete(Some(cronjob.id), None).await.unwrap();
}

#[tokio::test]
async fn materialization_advances_next_run_monotonically() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let (jobs, cronjobs) = cores(pool);
    jobs.init().await.unwrap();
    cronjobs.init().await.unwrap();

    let queue = support::unique("cq");
    let cronjob = cronjobs
        .create(&queue, None, "@every 1s", b"".to_vec(), HashMap::new())
        .await
        .unwrap();

    let before = cronjobs.get(Some(cronjob.id), None).await.unwrap().next_run_at;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    cronjobs.materialize_due().await.unwrap();
    let after = cronjobs.get(Some(cronjob.id), None).await.unwrap().next_run_at;
    assert!(
        after > before,
        "next_run_at did not advance: {} -> {}",
        before,
        after
    );

    cronjobs.delete(Some(cronjob.id), None).await.unwrap();
}

#[tokio::test]
async fn lookup_accepts_id_or_name() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let (jobs, cronjobs) = cores(pool);
    jobs.init().await.unwrap();
    cronjobs.init().await.unwrap();

    let queue = support::unique("cq");
    let name = support::unique("named");
    let cronjob = cronjobs
        .create(
            &queue,
            Some(name.clone()),
            "0 3 * * *",
            b"spec".to_vec(),
            HashMap::new(),
        )
        .await
        .unwrap();

    let by_id = cronjobs.get(Some(cronjob.id), None).await.unwrap();
    assert_eq!(by_id.name.as_deref(), Some(name.as_str()));
    let by_name = cronjobs.get(None, Some(&name)).await.unwrap();
    assert_eq!(by_name.id, cronjob.id);

    let deleted = cronjobs.delete(None, Some(&name)).await.unwrap();
    assert_eq!(deleted.id, cronjob.id);
    let err = cronjobs.get(Some(cronjob.id), None).await.unwrap_err();
    assert!(matches!(err, BackplaneError::NotFound(_)));
}

#[tokio::test]
async fn backend_loop_keeps_materializing() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let (jobs, cronjobs) = cores(pool);
    jobs.init().await.unwrap();
    cronjobs.init().await.unwrap();

    let queue = support::unique("cq");
    let cronjob = cronjobs
        .create(&queue, None, "@every 1s", b"".to_vec(), HashMap::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let backend = cronjobs.clone();
    let backend_cancel = cancel.clone();
    let handle = tokio::spawn(async move { backend.run_backend(backend_cancel).await });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    let _ = handle.await;

    let materialized = jobs
        .list(&[queue.clone()], &HashMap::new(), false)
        .await
        .unwrap();
    assert!(
        materialized.len() >= 2,
        "expected at least two firings, got {}",
        materialized.len()
    );

    cronjobs.delete(Some(cronjob.id), None).await.unwrap();
}
