//! Append-only event log with topic pub/sub and replayable sequences.
//!
//! The store assigns every event a monotonically increasing sequence at
//! insert. Subscribers keep a `(last_sequence, earliest_timestamp)` cursor:
//! the timestamp half only matters until the first event has been seen,
//! after which the sequence supersedes it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::sql;
use crate::ticker::Ticker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub sequence: i64,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    topic: String,
    payload: Vec<u8>,
    labels: sqlx::types::Json<HashMap<String, String>>,
    created_at: DateTime<Utc>,
    sequence: i64,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.event_id,
            topic: row.topic,
            payload: row.payload,
            labels: row.labels.0,
            created_at: row.created_at,
            sequence: row.sequence,
        }
    }
}

const EVENT_COLUMNS: &str = "event_id, topic, payload, labels, created_at, sequence";

#[derive(Clone)]
pub struct Events {
    pool: PgPool,
    config: CoreConfig,
}

impl Events {
    pub fn new(pool: PgPool, config: CoreConfig) -> Self {
        Self { pool, config }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events(
              event_id UUID PRIMARY KEY,
              topic TEXT NOT NULL,
              payload BYTEA NOT NULL DEFAULT ''::bytea,
              labels JSONB NOT NULL DEFAULT '{}',
              created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              sequence BIGSERIAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS events_topic_sequence_idx ON events(topic, sequence)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS events_labels_idx ON events USING GIN (labels)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append an event, returning it with the store-assigned sequence, and
    /// wake the topic's subscribers.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<Event> {
        let channel = sql::topic_channel(topic)?;

        let id = Uuid::new_v4();
        // The stored timestamp is what cursor comparisons run against, so
        // return it instead of a higher-precision client-side clock value.
        let (sequence, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO events (event_id, topic, payload, labels, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING sequence, created_at",
        )
        .bind(id)
        .bind(topic)
        .bind(&payload)
        .bind(sqlx::types::Json(&labels))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        sql::notify(&self.pool, &channel).await?;

        tracing::debug!(event_id = %id, topic, sequence, "event published");
        Ok(Event {
            id,
            topic: topic.to_string(),
            payload,
            labels,
            created_at,
            sequence,
        })
    }

    /// Stream events for `topic` into `out` in sequence order, resuming from
    /// the given cursor. Runs until cancellation or until the consumer goes
    /// away; store errors terminate the subscription.
    pub async fn subscribe(
        &self,
        topic: &str,
        labels: HashMap<String, String>,
        since_sequence: Option<i64>,
        since_created_at: Option<DateTime<Utc>>,
        out: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let channel = sql::topic_channel(topic)?;

        let mut ticks = Ticker::new(self.config.poll_interval, self.config.jitter_factor)
            .with_notifications(self.pool.clone(), &channel)
            .start(cancel.clone())
            .await?;

        let mut last_sequence = since_sequence;
        let mut earliest = since_created_at;

        while ticks.recv().await.is_some() {
            let mut builder = QueryBuilder::new(format!(
                "SELECT {} FROM events WHERE topic = ",
                EVENT_COLUMNS
            ));
            builder.push_bind(topic.to_string());
            if let Some(sequence) = last_sequence {
                builder.push(" AND sequence > ").push_bind(sequence);
            }
            if let Some(timestamp) = earliest {
                builder.push(" AND created_at >= ").push_bind(timestamp);
            }
            sql::push_labels_filter(&mut builder, &labels);
            builder.push(" ORDER BY sequence ASC");

            let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                let event = Event::from(row);
                let sequence = event.sequence;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = out.send(event) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
                // Only advance the cursor once the event has been delivered;
                // the sequence now supersedes the timestamp bound.
                last_sequence = Some(sequence);
                earliest = None;
            }
        }
        Ok(())
    }
}
