//! Shared query assembly helpers: dynamic filters over `QueryBuilder` and
//! the rules for NOTIFY channel identifiers.

use std::collections::HashMap;

use sqlx::{PgExecutor, Postgres, QueryBuilder};

use crate::error::{BackplaneError, Result};

// Postgres truncates identifiers beyond NAMEDATALEN-1.
const MAX_CHANNEL_LEN: usize = 63;

/// Append `AND queue = ANY(..)` when at least one queue is given.
pub fn push_queues_filter(builder: &mut QueryBuilder<'_, Postgres>, queues: &[String]) {
    if queues.is_empty() {
        return;
    }
    builder
        .push(" AND queue = ANY(")
        .push_bind(queues.to_vec())
        .push(")");
}

/// Append a JSONB containment predicate (`labels @> $n`) when the filter map
/// is non-empty. An empty map would match every row, so it is skipped.
pub fn push_labels_filter(
    builder: &mut QueryBuilder<'_, Postgres>,
    labels: &HashMap<String, String>,
) {
    if labels.is_empty() {
        return;
    }
    builder
        .push(" AND labels @> ")
        .push_bind(sqlx::types::Json(labels.clone()));
}

/// Validate a NOTIFY channel identifier: ASCII letters, digits and
/// underscores, not starting with a digit.
pub fn validate_channel(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CHANNEL_LEN
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BackplaneError::InvalidArgument(format!(
            "{:?} is not a valid notification channel name",
            name
        )))
    }
}

/// Notification channel for an event topic: hyphens become underscores to
/// keep the identifier legal, then the full name is validated.
pub fn topic_channel(topic: &str) -> Result<String> {
    if topic.is_empty() {
        return Err(BackplaneError::InvalidArgument(
            "topic must not be empty".to_string(),
        ));
    }
    let channel = format!("events_{}", topic.replace('-', "_"));
    validate_channel(&channel)?;
    Ok(channel)
}

/// Emit a NOTIFY on `channel`. `pg_notify` takes the channel as a bind
/// parameter, so no identifier splicing happens here.
pub async fn notify<'c, E>(executor: E, channel: &str) -> Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel)
        .execute(executor)
        .await?;
    Ok(())
}
