//! Jobs core: creation, querying, heartbeats and the dispatch loop.
//!
//! A job is claimable while it is unfinished and either never started or
//! stale (its last heartbeat is older than the heartbeat deadline). Each
//! claim runs in a serializable transaction, so a job row moves to exactly
//! one listener per successful claim; a worker that dies simply stops
//! heartbeating and the row becomes claimable again — at-least-once
//! delivery, so job handlers must be idempotent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool, QueryBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{BackplaneError, Result};
use crate::sql;
use crate::ticker::Ticker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub spec: Vec<u8>,
    pub labels: HashMap<String, String>,
    pub state: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    queue: String,
    spec: Vec<u8>,
    labels: sqlx::types::Json<HashMap<String, String>>,
    state: Option<Vec<u8>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.job_id,
            queue: row.queue,
            spec: row.spec,
            labels: row.labels.0,
            state: row.state,
            created_at: row.created_at,
            started_at: row.started_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        }
    }
}

const JOB_COLUMNS: &str =
    "job_id, queue, spec, labels, state, created_at, started_at, updated_at, finished_at";

#[derive(Clone)]
pub struct Jobs {
    pool: PgPool,
    config: CoreConfig,
}

impl Jobs {
    pub fn new(pool: PgPool, config: CoreConfig) -> Self {
        Self { pool, config }
    }

    /// Create the `jobs` table and its indexes if they do not exist yet.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs(
              job_id UUID PRIMARY KEY,
              queue TEXT NOT NULL,
              spec BYTEA NOT NULL DEFAULT ''::bytea,
              labels JSONB NOT NULL DEFAULT '{}',
              state BYTEA,
              created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              started_at TIMESTAMPTZ,
              updated_at TIMESTAMPTZ,
              finished_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS jobs_queue_created_at_idx ON jobs(queue, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_labels_idx ON jobs USING GIN (labels)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a new job and wake listeners on the queue's channel.
    pub async fn create(
        &self,
        queue: &str,
        spec: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<Job> {
        if queue.is_empty() {
            return Err(BackplaneError::InvalidArgument(
                "queue must not be empty".to_string(),
            ));
        }
        sql::validate_channel(queue)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (job_id, queue, spec, labels, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(queue)
        .bind(&spec)
        .bind(sqlx::types::Json(&labels))
        .bind(now)
        .execute(&self.pool)
        .await?;

        sql::notify(&self.pool, queue).await?;

        tracing::debug!(job_id = %id, queue, "job created");
        Ok(Job {
            id,
            queue: queue.to_string(),
            spec,
            labels,
            state: None,
            created_at: now,
            started_at: None,
            updated_at: None,
            finished_at: None,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        fetch_job(&self.pool, id)
            .await?
            .ok_or_else(|| BackplaneError::NotFound(format!("job {}", id)))
    }

    /// Delete a job and return its pre-delete snapshot.
    pub async fn delete(&self, id: Uuid) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = fetch_job(&mut *tx, id)
            .await?
            .ok_or_else(|| BackplaneError::NotFound(format!("job {}", id)))?;
        sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Renew a job's heartbeat lease, optionally updating its progress state
    /// and optionally marking it finished. Returns the updated job.
    pub async fn heartbeat(
        &self,
        id: Uuid,
        state: Option<Vec<u8>>,
        finished: bool,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = fetch_job(&mut *tx, id)
            .await?
            .ok_or_else(|| BackplaneError::NotFound(format!("job {}", id)))?;

        let now = Utc::now();
        job.updated_at = Some(now);

        let mut builder = QueryBuilder::new("UPDATE jobs SET updated_at = ");
        builder.push_bind(now);
        if let Some(state) = &state {
            builder.push(", state = ").push_bind(state.clone());
            job.state = Some(state.clone());
        }
        if finished {
            builder.push(", finished_at = ").push_bind(now);
            job.finished_at = Some(now);
        }
        builder.push(" WHERE job_id = ").push_bind(id);
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(job)
    }

    /// List jobs ordered by creation time. `queues` is an OR filter, labels
    /// filter by JSONB containment.
    pub async fn list(
        &self,
        queues: &[String],
        labels: &HashMap<String, String>,
        exclude_finished: bool,
    ) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::new(format!("SELECT {} FROM jobs WHERE TRUE", JOB_COLUMNS));
        sql::push_queues_filter(&mut builder, queues);
        sql::push_labels_filter(&mut builder, labels);
        if exclude_finished {
            builder.push(" AND finished_at IS NULL");
        }
        builder.push(" ORDER BY created_at ASC");
        let rows: Vec<JobRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// The dispatch loop: claim the oldest claimable job on every tick and
    /// deliver it to `out`. Returns cleanly on cancellation or when the
    /// consumer goes away; store errors other than serialization conflicts
    /// terminate the loop.
    pub async fn listen(
        &self,
        queue: &str,
        out: mpsc::Sender<Job>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if queue.is_empty() {
            return Err(BackplaneError::InvalidArgument(
                "queue must not be empty".to_string(),
            ));
        }
        sql::validate_channel(queue)?;

        let mut ticks = Ticker::new(self.config.poll_interval, self.config.jitter_factor)
            .with_notifications(self.pool.clone(), queue)
            .start(cancel.clone())
            .await?;

        while ticks.recv().await.is_some() {
            let job = match self.claim_one(queue).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) if err.is_serialization_failure() => {
                    tracing::debug!(queue, "claim lost a serialization race, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            };
            tracing::info!(job_id = %job.id, queue, "dispatching job");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = out.send(job) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// One claim attempt under serializable isolation: select the oldest
    /// claimable row, mark it started, commit.
    async fn claim_one(&self, queue: &str) -> Result<Option<Job>> {
        let deadline = chrono::Duration::from_std(self.config.heartbeat_deadline)
            .map_err(|err| BackplaneError::Internal(format!("heartbeat deadline: {}", err)))?;
        let now = Utc::now();
        let stale_before = now - deadline;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs \
             WHERE queue = $1 AND finished_at IS NULL \
               AND (started_at IS NULL OR updated_at < $2) \
             ORDER BY created_at ASC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(queue)
        .bind(stale_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE jobs SET started_at = $1, updated_at = $1 WHERE job_id = $2")
            .bind(now)
            .bind(row.job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut job = Job::from(row);
        job.started_at = Some(now);
        job.updated_at = Some(now);
        Ok(Some(job))
    }
}

async fn fetch_job<'c, E>(executor: E, id: Uuid) -> Result<Option<Job>>
where
    E: PgExecutor<'c>,
{
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "SELECT {} FROM jobs WHERE job_id = $1",
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_jobs() -> Jobs {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost:5432/backplane")
            .unwrap();
        Jobs::new(pool, CoreConfig::default())
    }

    #[tokio::test]
    async fn create_rejects_invalid_queue_names() {
        let jobs = lazy_jobs();
        for queue in ["", "my-queue", "queue name", "1queue"] {
            let err = jobs
                .create(queue, b"{}".to_vec(), HashMap::new())
                .await
                .unwrap_err();
            assert!(
                matches!(err, BackplaneError::InvalidArgument(_)),
                "queue {:?} produced {:?}",
                queue,
                err
            );
        }
    }

    #[tokio::test]
    async fn listen_rejects_invalid_queue_names() {
        let jobs = lazy_jobs();
        let (tx, _rx) = mpsc::channel(1);
        let err = jobs
            .listen("not a channel", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackplaneError::InvalidArgument(_)));
    }
}
