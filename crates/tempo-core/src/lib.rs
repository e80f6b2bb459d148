//! `tempo-core`: shared records, status machine, validation and config.

pub mod config;
pub mod error;
pub mod types;
pub mod validate;

pub use error::{Result, TempoError, ValidationError};
pub use types::{
    ActivationChange, PeriodicTask, ScheduleLimit, Task, TaskFailure, TaskStatus,
};
