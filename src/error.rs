use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackplaneError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("lock {0} is held by another owner")]
    Locked(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("operation canceled")]
    Canceled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BackplaneError>;

impl BackplaneError {
    /// True when the error is a benign serializable-transaction conflict.
    /// The dispatch, materialization and acquire loops retry these on the
    /// next tick instead of surfacing them.
    pub fn is_serialization_failure(&self) -> bool {
        match self {
            BackplaneError::Database(err) => is_serialization_failure(err),
            _ => false,
        }
    }
}

/// SQLSTATE 40001 (serialization_failure) and 40P01 (deadlock_detected).
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "40001" || code.as_ref() == "40P01";
        }
    }
    false
}

impl From<BackplaneError> for tonic::Status {
    fn from(err: BackplaneError) -> Self {
        match err {
            BackplaneError::InvalidArgument(msg) => tonic::Status::invalid_argument(msg),
            BackplaneError::NotFound(what) => {
                tonic::Status::not_found(format!("{} not found", what))
            }
            BackplaneError::Locked(id) => {
                tonic::Status::failed_precondition(format!("lock {} is held", id))
            }
            BackplaneError::Unavailable(msg) => tonic::Status::unavailable(msg),
            BackplaneError::Canceled => tonic::Status::cancelled("operation canceled"),
            BackplaneError::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    tonic::Status::unavailable(format!("database unavailable: {}", err))
                }
                err => tonic::Status::internal(format!("database error: {}", err)),
            },
            BackplaneError::Rpc(status) => status,
            err => tonic::Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        let cases = [
            (
                BackplaneError::InvalidArgument("bad queue".into()),
                tonic::Code::InvalidArgument,
            ),
            (
                BackplaneError::NotFound("job 42".into()),
                tonic::Code::NotFound,
            ),
            (
                BackplaneError::Locked("migrations".into()),
                tonic::Code::FailedPrecondition,
            ),
            (
                BackplaneError::Unavailable("db down".into()),
                tonic::Code::Unavailable,
            ),
            (BackplaneError::Canceled, tonic::Code::Cancelled),
            (
                BackplaneError::Internal("boom".into()),
                tonic::Code::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(tonic::Status::from(err).code(), code);
        }
    }

    #[test]
    fn row_not_found_is_not_a_serialization_failure() {
        assert!(!is_serialization_failure(&sqlx::Error::RowNotFound));
    }
}
