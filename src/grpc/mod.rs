pub mod cronjobs_service;
pub mod events_service;
pub mod jobs_service;
pub mod locks_service;
pub mod server;

pub use server::GrpcServer;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::BackplaneError;

pub(crate) fn to_timestamp(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

pub(crate) fn from_timestamp(
    ts: &prost_types::Timestamp,
) -> Result<DateTime<Utc>, BackplaneError> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
        .single()
        .ok_or_else(|| BackplaneError::InvalidArgument("timestamp out of range".to_string()))
}

pub(crate) fn parse_id(id: &str) -> Result<Uuid, BackplaneError> {
    Uuid::parse_str(id)
        .map_err(|_| BackplaneError::InvalidArgument(format!("invalid id {:?}", id)))
}
