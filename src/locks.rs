//! Named distributed locks with lease-based ownership.
//!
//! A lock row is held while its lease timestamp is fresher than the hold
//! deadline. Releasing writes the zero timestamp, so the held-check
//! `now - updated_at < hold_deadline` covers both released and expired
//! leases with a single predicate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::CoreConfig;
use crate::error::{BackplaneError, Result};
use crate::proto::locks_client::LocksClient;
use crate::proto::{AcquireRequest, HoldRequest, ReleaseRequest};
use crate::sql;
use crate::ticker::Ticker;

/// All lock waiters share one notification channel; a release wakes them up
/// for the next acquisition race.
pub const LOCKS_CHANNEL: &str = "locks";

#[derive(Clone)]
pub struct Locks {
    pool: PgPool,
    config: CoreConfig,
}

impl Locks {
    pub fn new(pool: PgPool, config: CoreConfig) -> Self {
        Self { pool, config }
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks(
              lock_id TEXT PRIMARY KEY,
              updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Block until the lock is owned or the caller cancels. Retries on every
    /// tick of the `locks` channel ticker, so a release wakes waiters
    /// immediately instead of after a full poll interval.
    pub async fn acquire(&self, id: &str, cancel: CancellationToken) -> Result<()> {
        if id.is_empty() {
            return Err(BackplaneError::InvalidArgument(
                "lock id must not be empty".to_string(),
            ));
        }
        let mut ticks = Ticker::new(self.config.poll_interval, self.config.jitter_factor)
            .with_notifications(self.pool.clone(), LOCKS_CHANNEL)
            .start(cancel.clone())
            .await?;

        while ticks.recv().await.is_some() {
            match self.try_acquire(id).await {
                Ok(()) => {
                    tracing::debug!(lock_id = id, "lock acquired");
                    return Ok(());
                }
                Err(BackplaneError::Locked(_)) => continue,
                Err(err) if err.is_serialization_failure() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(BackplaneError::Canceled)
    }

    /// Single acquisition attempt under serializable isolation: insert a
    /// fresh lease, take over a stale one, or fail with `Locked`.
    pub async fn try_acquire(&self, id: &str) -> Result<()> {
        let deadline = chrono::Duration::from_std(self.config.hold_deadline)
            .map_err(|err| BackplaneError::Internal(format!("hold deadline: {}", err)))?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT updated_at FROM locks WHERE lock_id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            None => {
                sqlx::query("INSERT INTO locks (lock_id, updated_at) VALUES ($1, $2)")
                    .bind(id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
            Some((updated_at,)) => {
                if now - updated_at > deadline {
                    // Stale lease takeover.
                    sqlx::query("UPDATE locks SET updated_at = $1 WHERE lock_id = $2")
                        .bind(now)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    return Err(BackplaneError::Locked(id.to_string()));
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Renew the lease for `id`.
    pub async fn hold(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE locks SET updated_at = $1 WHERE lock_id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackplaneError::NotFound(format!("lock {}", id)));
        }
        Ok(())
    }

    /// Mark the lease released and wake all waiters. Releasing an unknown
    /// lock is a no-op.
    pub async fn release(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE locks SET updated_at = to_timestamp(0) WHERE lock_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sql::notify(&self.pool, LOCKS_CHANNEL).await?;
        Ok(())
    }
}

/// Client-side convenience: acquire `id`, then keep renewing the lease in
/// the background until `cancel` fires, at which point the lock is released.
///
/// Returns once ownership is established; callers scope `cancel` to the
/// critical section so dropping out of it releases the lock.
pub async fn hold_lock(
    mut client: LocksClient<Channel>,
    id: impl Into<String>,
    renew_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let id = id.into();
    client
        .acquire(AcquireRequest { id: id.clone() })
        .await?;

    tokio::spawn(async move {
        let mut renew = tokio::time::interval(renew_interval);
        renew.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = client.release(ReleaseRequest { id: id.clone() }).await {
                        tracing::error!(lock_id = %id, error = %err, "failed to release lock");
                    }
                    return;
                }
                _ = renew.tick() => {
                    if let Err(err) = client.hold(HoldRequest { id: id.clone() }).await {
                        tracing::error!(lock_id = %id, error = %err, "failed to renew lock lease");
                    }
                }
            }
        }
    });

    Ok(())
}
