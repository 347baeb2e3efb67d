//! Minimal monitoring listener: `GET /healthz` reports database liveness.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::db;
use crate::error::{BackplaneError, Result};

pub struct HealthServer {
    listener: tokio::net::TcpListener,
    pool: PgPool,
}

impl HealthServer {
    /// Bind the listener eagerly so a bad address fails startup instead of
    /// a background task.
    pub async fn bind(addr: SocketAddr, pool: PgPool) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
            BackplaneError::Unavailable(format!(
                "failed to bind health listener on {}: {}",
                addr, err
            ))
        })?;
        Ok(Self { listener, pool })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "starting health listener");
        }
        let app = Router::new()
            .route("/healthz", get(healthz))
            .with_state(self.pool);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|err| BackplaneError::Internal(format!("health listener failed: {}", err)))?;
        Ok(())
    }
}

async fn healthz(State(pool): State<PgPool>) -> impl IntoResponse {
    match db::ping(&pool).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "ok": false })))
        }
    }
}
