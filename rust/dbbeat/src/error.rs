//! Error types for schedule validation and storage.
//!
//! Validation errors are raised when a schedule row is written; storage
//! errors surface from [`crate::store::ScheduleStore`] implementations and are
//! classified so the scheduler can tell a transient outage from a conflict.

use thiserror::Error;

use crate::schedule::{CrontabUnit, IntervalPeriod, ScheduleKind};

/// A schedule definition that must not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("schedule name must not be empty")]
    EmptyName,

    #[error("task name must not be empty")]
    EmptyTask,

    /// A crontab field expression failed to parse.
    #[error("invalid crontab {field} `{value}`: {reason}")]
    Crontab {
        field: CrontabUnit,
        value: String,
        reason: String,
    },

    #[error("expire_time and expire_seconds cannot both be set")]
    ExpiryConflict,

    #[error("{kind} schedule requires `{field}`")]
    MissingField {
        kind: ScheduleKind,
        field: &'static str,
    },

    #[error("interval must be a positive, representable duration (got {every} {period})")]
    InvalidInterval { every: i64, period: IntervalPeriod },

    /// `args` or `kwargs` are not the JSON shape the task expects.
    #[error("invalid {field}: {reason}")]
    InvalidPayload { field: &'static str, reason: String },
}

/// Failure reported by a schedule store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or is locked; retrying later may work.
    #[error("schedule store unavailable: {0}")]
    Unavailable(String),

    /// A row with the same name already exists.
    #[error("schedule `{0}` already exists")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("schedule store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the error is worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Backend(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Backend(format!("blocking task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crontab_error_names_field_and_value() {
        let err = ValidationError::Crontab {
            field: CrontabUnit::Minute,
            value: "70".to_string(),
            reason: "value 70 out of range 0-59".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("minute"));
        assert!(message.contains("70"));
    }

    #[test]
    fn test_busy_sqlite_error_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let err = StoreError::from(busy);
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_transient());

        let conflict = StoreError::Conflict("nightly".to_string());
        assert!(!conflict.is_transient());
    }
}
