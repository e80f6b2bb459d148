use tempo_core::{TempoError, ValidationError};
use tempo_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduling loops and schedule service.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rejected before anything was persisted.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Core(#[from] TempoError),

    /// A tick running on the blocking pool panicked or was cancelled.
    #[error("Tick aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SchedulerError {
    /// Whether a fresh store connection might clear the failure.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_connectivity())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
