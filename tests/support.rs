//! Shared helpers for the database-backed integration suites.
//!
//! The suites need a reachable Postgres instance and skip themselves when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use std::time::Duration;

use backplane::config::CoreConfig;
use sqlx::PgPool;

pub async fn test_pool() -> Option<PgPool> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: TEST_DATABASE_URL is not set");
            return None;
        }
    };
    Some(
        PgPool::connect(&url)
            .await
            .expect("failed to connect to TEST_DATABASE_URL"),
    )
}

/// Tight deadlines so recovery paths fire within a test timeout.
pub fn fast_config() -> CoreConfig {
    CoreConfig {
        poll_interval: Duration::from_millis(100),
        heartbeat_deadline: Duration::from_millis(400),
        hold_deadline: Duration::from_millis(400),
        jitter_factor: 0.1,
    }
}

/// A fresh channel-safe name so concurrent suites can share one database.
pub fn unique(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
