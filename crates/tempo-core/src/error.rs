use thiserror::Error;

use crate::types::TaskStatus;

#[derive(Debug, Error)]
pub enum TempoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid status transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A schedule or task definition that must never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `end_time` and `max_number_of_executions` are mutually exclusive.
    #[error("schedule {id}: end_time and max_number_of_executions cannot both be set")]
    ConflictingLimits { id: String },

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("max_number_of_executions must be at least 1")]
    ZeroExecutions,
}

pub type Result<T> = std::result::Result<T, TempoError>;
