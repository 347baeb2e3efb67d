//! Database connection management.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::error::{BackplaneError, Result};

const MAX_CONNECT_ATTEMPTS: u32 = 8;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connect to Postgres with bounded exponential backoff.
///
/// Startup tolerates a database that is still coming up, but gives up after
/// `MAX_CONNECT_ATTEMPTS` so a misconfigured connect string fails the
/// process instead of spinning forever.
pub async fn connect(url: &str, cancel: &CancellationToken) -> Result<PgPool> {
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err = None;

    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(BackplaneError::Canceled);
        }
        match PgPoolOptions::new().max_connections(16).connect(url).await {
            Ok(pool) => {
                tracing::info!(attempt, "connected to database");
                return Ok(pool);
            }
            Err(err) => {
                tracing::warn!(attempt, error = %err, "database connection failed, retrying");
                last_err = Some(err);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(BackplaneError::Canceled),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    Err(BackplaneError::Unavailable(format!(
        "database unreachable after {} attempts: {}",
        MAX_CONNECT_ATTEMPTS,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Liveness probe used by the health endpoint.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
