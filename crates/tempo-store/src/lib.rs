//! `tempo-store`: persistence for tasks and schedules.
//!
//! The scheduler only talks to the [`TaskStore`] and [`PeriodicTaskStore`]
//! traits. [`SqliteStore`] implements both on top of a single SQLite file:
//!
//! | Table            | Constraint                                          |
//! |------------------|-----------------------------------------------------|
//! | `tasks`          | `id` unique; status restricted to the five states   |
//! | `periodic_tasks` | `end_time` and `max_number_of_executions` exclusive |

pub mod db;
pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use store::{PeriodicTaskStore, Reconnect, TaskStore};
