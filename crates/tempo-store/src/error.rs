use tempo_core::{TaskStatus, ValidationError};
use thiserror::Error;

/// Errors raised by task and schedule persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error. Treated as a connectivity failure
    /// by the polling loops.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A record with this id already exists.
    #[error("Duplicate id: {id}")]
    DuplicateId { id: String },

    #[error("Record not found: {id}")]
    NotFound { id: String },

    /// The record was rejected before any write.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The caller asked to persist a status change the state machine forbids.
    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether a fresh connection might make the failure go away.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
