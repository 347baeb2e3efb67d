mod support;

use std::collections::HashMap;
use std::time::Duration;

use backplane::events::{Event, Events};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Subscribe and collect up to `count` events within `within`.
async fn collect(
    events: &Events,
    topic: &str,
    filter: HashMap<String, String>,
    since_sequence: Option<i64>,
    since_created_at: Option<DateTime<Utc>>,
    count: usize,
    within: Duration,
) -> Vec<Event> {
    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let sub_events = events.clone();
    let sub_topic = topic.to_string();
    let sub_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        sub_events
            .subscribe(
                &sub_topic,
                filter,
                since_sequence,
                since_created_at,
                tx,
                sub_cancel,
            )
            .await
    });

    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    while received.len() < count {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => received.push(event),
            _ => break,
        }
    }
    cancel.cancel();
    drop(rx);
    let _ = handle.await;
    received
}

#[tokio::test]
async fn publish_assigns_increasing_sequences() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool, support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    let first = events
        .publish(&topic, b"1".to_vec(), HashMap::new())
        .await
        .unwrap();
    let second = events
        .publish(&topic, b"2".to_vec(), HashMap::new())
        .await
        .unwrap();
    assert!(second.sequence > first.sequence);
}

#[tokio::test]
async fn replay_from_the_beginning_is_ordered() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool, support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    events
        .publish(&topic, b"1".to_vec(), HashMap::new())
        .await
        .unwrap();
    events
        .publish(&topic, b"2".to_vec(), HashMap::new())
        .await
        .unwrap();

    let replayed = collect(
        &events,
        &topic,
        HashMap::new(),
        None,
        None,
        2,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].payload, b"1".to_vec());
    assert_eq!(replayed[1].payload, b"2".to_vec());
    assert!(replayed[0].sequence < replayed[1].sequence);
}

#[tokio::test]
async fn cursor_resumes_after_a_sequence() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool, support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    let first = events
        .publish(&topic, b"1".to_vec(), HashMap::new())
        .await
        .unwrap();
    let second = events
        .publish(&topic, b"2".to_vec(), HashMap::new())
        .await
        .unwrap();

    let resumed = collect(
        &events,
        &topic,
        HashMap::new(),
        Some(first.sequence),
        None,
        2,
        Duration::from_millis(800),
    )
    .await;
    assert_eq!(resumed.len(), 1, "only the second event should replay");
    assert_eq!(resumed[0].id, second.id);
}

#[tokio::test]
async fn label_filter_restricts_the_stream() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool, support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    let wanted = events
        .publish(&topic, b"a".to_vec(), labels(&[("k", "a")]))
        .await
        .unwrap();
    events
        .publish(&topic, b"b".to_vec(), labels(&[("k", "b")]))
        .await
        .unwrap();

    let filtered = collect(
        &events,
        &topic,
        labels(&[("k", "a")]),
        None,
        None,
        2,
        Duration::from_millis(800),
    )
    .await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, wanted.id);
}

#[tokio::test]
async fn timestamp_cursor_bounds_replay() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool, support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    events
        .publish(&topic, b"old".to_vec(), HashMap::new())
        .await
        .unwrap();
    let new = events
        .publish(&topic, b"new".to_vec(), HashMap::new())
        .await
        .unwrap();

    let bounded = collect(
        &events,
        &topic,
        HashMap::new(),
        None,
        Some(new.created_at),
        2,
        Duration::from_millis(800),
    )
    .await;
    assert_eq!(bounded.len(), 1);
    assert_eq!(bounded[0].id, new.id);
}

#[tokio::test]
async fn live_events_reach_subscribers() {
    let Some(pool) = support::test_pool().await else {
        return;
    };
    let events = Events::new(pool.clone(), support::fast_config());
    events.init().await.unwrap();

    let topic = support::unique("t");
    let publisher = events.clone();
    let publish_topic = topic.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        publisher
            .publish(&publish_topic, b"live".to_vec(), HashMap::new())
            .await
            .unwrap();
    });

    let received = collect(
        &events,
        &topic,
        HashMap::new(),
        None,
        None,
        1,
        Duration::from_secs(3),
    )
    .await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"live".to_vec());
}
