//! Cron schedules and their materialization into jobs.
//!
//! A cron row carries a schedule expression and the next firing time. The
//! background loop advances `next_run_at` for all due rows inside one
//! serializable transaction, commits, and only then emits the derived jobs.
//! The advance being durable before any job is observable means a crash
//! between the two steps loses at most one firing and never duplicates one;
//! the next tick re-fires any row that is still due.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool, QueryBuilder};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{parse_duration, CoreConfig};
use crate::error::{BackplaneError, Result};
use crate::jobs::Jobs;
use crate::sql;

/// Labels stamped onto every materialized job.
pub const CRONJOB_ID_LABEL: &str = "@system/cronjob-id";
pub const CRONJOB_NAME_LABEL: &str = "@system/cronjob-name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub queue: String,
    pub name: Option<String>,
    pub spec: Vec<u8>,
    pub cron: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CronJobRow {
    cronjob_id: Uuid,
    queue: String,
    name: Option<String>,
    spec: Vec<u8>,
    cron: String,
    labels: sqlx::types::Json<HashMap<String, String>>,
    created_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
}

impl From<CronJobRow> for CronJob {
    fn from(row: CronJobRow) -> Self {
        CronJob {
            id: row.cronjob_id,
            queue: row.queue,
            name: row.name,
            spec: row.spec,
            cron: row.cron,
            labels: row.labels.0,
            created_at: row.created_at,
            next_run_at: row.next_run_at,
        }
    }
}

const CRONJOB_COLUMNS: &str =
    "cronjob_id, queue, name, spec, cron, labels, created_at, next_run_at";

/// A parsed schedule expression: either the original `@every <duration>`
/// descriptor or a cron expression (5-field expressions are normalized to
/// the 6-field form by prepending a seconds column).
#[derive(Debug, Clone)]
pub enum CronSpec {
    Every(Duration),
    Expr(cron::Schedule),
}

impl CronSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BackplaneError::InvalidArgument(
                "cron expression must not be empty".to_string(),
            ));
        }
        if let Some(rest) = input.strip_prefix("@every ") {
            let every = parse_duration(rest).map_err(|err| {
                BackplaneError::InvalidArgument(format!("invalid @every duration: {}", err))
            })?;
            if every.is_zero() {
                return Err(BackplaneError::InvalidArgument(
                    "@every duration must be positive".to_string(),
                ));
            }
            return Ok(CronSpec::Every(every));
        }
        let normalized = if input.split_whitespace().count() == 5 {
            format!("0 {}", input)
        } else {
            input.to_string()
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|err| {
            BackplaneError::InvalidArgument(format!("invalid cron expression {:?}: {}", input, err))
        })?;
        Ok(CronSpec::Expr(schedule))
    }

    /// The next firing time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            CronSpec::Every(every) => {
                let every = chrono::Duration::from_std(*every).map_err(|err| {
                    BackplaneError::InvalidArgument(format!("@every duration: {}", err))
                })?;
                Ok(now + every)
            }
            CronSpec::Expr(schedule) => schedule.after(&now).next().ok_or_else(|| {
                BackplaneError::InvalidArgument(
                    "schedule has no future firing times".to_string(),
                )
            }),
        }
    }
}

#[derive(Clone)]
pub struct CronJobs {
    pool: PgPool,
    config: CoreConfig,
    jobs: Jobs,
}

impl CronJobs {
    pub fn new(pool: PgPool, config: CoreConfig, jobs: Jobs) -> Self {
        Self { pool, config, jobs }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cronjobs(
              cronjob_id UUID PRIMARY KEY,
              queue TEXT NOT NULL,
              name TEXT UNIQUE,
              spec BYTEA NOT NULL DEFAULT ''::bytea,
              cron TEXT NOT NULL,
              labels JSONB NOT NULL DEFAULT '{}',
              created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
              next_run_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS cronjobs_next_run_at_idx ON cronjobs(next_run_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS cronjobs_labels_idx ON cronjobs USING GIN (labels)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a schedule. The expression is parsed eagerly so malformed
    /// schedules are rejected here instead of poisoning the backend loop.
    /// `next_run_at` starts at `now`, making the first firing immediate.
    pub async fn create(
        &self,
        queue: &str,
        name: Option<String>,
        cron_expr: &str,
        spec: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<CronJob> {
        if queue.is_empty() {
            return Err(BackplaneError::InvalidArgument(
                "queue must not be empty".to_string(),
            ));
        }
        sql::validate_channel(queue)?;
        CronSpec::parse(cron_expr)?;
        let name = name.filter(|n| !n.is_empty());

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO cronjobs (cronjob_id, queue, name, spec, cron, labels, created_at, next_run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(id)
        .bind(queue)
        .bind(&name)
        .bind(&spec)
        .bind(cron_expr)
        .bind(sqlx::types::Json(&labels))
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(cronjob_id = %id, queue, cron = cron_expr, "cron schedule created");

        // Fire due rows right away so a fresh schedule does not wait for the
        // next backend tick. A lost serialization race is fine, the backend
        // will pick the row up.
        if let Err(err) = self.materialize_due().await {
            if !err.is_serialization_failure() {
                return Err(err);
            }
        }

        Ok(CronJob {
            id,
            queue: queue.to_string(),
            name,
            spec,
            cron: cron_expr.to_string(),
            labels,
            created_at: now,
            next_run_at: now,
        })
    }

    /// Look up by id or name; at least one must be given.
    pub async fn get(&self, id: Option<Uuid>, name: Option<&str>) -> Result<CronJob> {
        fetch_cronjob(&self.pool, id, name)
            .await?
            .ok_or_else(|| BackplaneError::NotFound(describe(id, name)))
    }

    /// Delete by id or name, returning the pre-delete snapshot.
    pub async fn delete(&self, id: Option<Uuid>, name: Option<&str>) -> Result<CronJob> {
        let mut tx = self.pool.begin().await?;
        let cronjob = fetch_cronjob(&mut *tx, id, name)
            .await?
            .ok_or_else(|| BackplaneError::NotFound(describe(id, name)))?;
        sqlx::query("DELETE FROM cronjobs WHERE cronjob_id = $1")
            .bind(cronjob.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(cronjob)
    }

    pub async fn list(
        &self,
        queues: &[String],
        labels: &HashMap<String, String>,
    ) -> Result<Vec<CronJob>> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {} FROM cronjobs WHERE TRUE",
            CRONJOB_COLUMNS
        ));
        sql::push_queues_filter(&mut builder, queues);
        sql::push_labels_filter(&mut builder, labels);
        builder.push(" ORDER BY created_at ASC");
        let rows: Vec<CronJobRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Materialization backend: one pass at startup, then one per poll
    /// interval until canceled.
    pub async fn run_backend(&self, cancel: CancellationToken) {
        loop {
            match self.materialize_due().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "materialized cron schedules"),
                Err(err) if err.is_serialization_failure() => {
                    tracing::debug!("materialization lost a serialization race, retrying next tick");
                }
                Err(err) => tracing::error!(error = %err, "failed to materialize cron schedules"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Advance all due schedules in one serializable transaction, then emit
    /// a job per advanced row. A parse error on any row aborts the whole
    /// transaction; emission failures are logged and do not roll back the
    /// already-committed schedule advance.
    pub async fn materialize_due(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let rows: Vec<CronJobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM cronjobs WHERE next_run_at < $1",
            CRONJOB_COLUMNS
        ))
        .bind(Utc::now())
        .fetch_all(&mut *tx)
        .await?;
        let due: Vec<CronJob> = rows.into_iter().map(Into::into).collect();

        for cronjob in &due {
            let schedule = CronSpec::parse(&cronjob.cron)?;
            let next_run_at = schedule.next_after(Utc::now())?;
            tracing::debug!(cronjob_id = %cronjob.id, %next_run_at, "advancing schedule");
            sqlx::query("UPDATE cronjobs SET next_run_at = $1 WHERE cronjob_id = $2")
                .bind(next_run_at)
                .bind(cronjob.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        // The advance is durable; now the derived jobs may become visible.
        for cronjob in &due {
            let mut labels = cronjob.labels.clone();
            labels.insert(CRONJOB_ID_LABEL.to_string(), cronjob.id.to_string());
            labels.insert(
                CRONJOB_NAME_LABEL.to_string(),
                cronjob.name.clone().unwrap_or_default(),
            );
            match self
                .jobs
                .create(&cronjob.queue, cronjob.spec.clone(), labels)
                .await
            {
                Ok(job) => {
                    tracing::info!(cronjob_id = %cronjob.id, job_id = %job.id, queue = %job.queue, "materialized job")
                }
                Err(err) => {
                    tracing::error!(cronjob_id = %cronjob.id, error = %err, "failed to emit materialized job")
                }
            }
        }

        Ok(due.len())
    }
}

fn describe(id: Option<Uuid>, name: Option<&str>) -> String {
    match (id, name) {
        (Some(id), _) => format!("cronjob {}", id),
        (None, Some(name)) => format!("cronjob {:?}", name),
        (None, None) => "cronjob".to_string(),
    }
}

async fn fetch_cronjob<'c, E>(
    executor: E,
    id: Option<Uuid>,
    name: Option<&str>,
) -> Result<Option<CronJob>>
where
    E: PgExecutor<'c>,
{
    if id.is_none() && name.is_none() {
        return Err(BackplaneError::InvalidArgument(
            "either id or name is required".to_string(),
        ));
    }
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM cronjobs WHERE FALSE",
        CRONJOB_COLUMNS
    ));
    if let Some(id) = id {
        builder.push(" OR cronjob_id = ").push_bind(id);
    }
    if let Some(name) = name {
        builder.push(" OR name = ").push_bind(name.to_string());
    }
    let row: Option<CronJobRow> = builder.build_query_as().fetch_optional(executor).await?;
    Ok(row.map(Into::into))
}
