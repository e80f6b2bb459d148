//! `tempo-scheduler`: the two polling loops and what they need.
//!
//! # Overview
//!
//! The [`TaskProcessor`] polls the task store for open tasks whose eta has
//! arrived and runs them through the [`HandlerRegistry`]. The
//! [`PeriodicPopulator`] expands active cron schedules into open tasks. The
//! loops never talk to each other; the store is their only shared state.
//!
//! ```text
//! PeriodicPopulator ──create──▶ TaskStore ◀──poll/transition── TaskProcessor ──▶ HandlerRegistry
//! ```
//!
//! Both loops stop cooperatively through a `CancellationToken` checked at tick
//! boundaries.

pub mod builtin;
pub mod crontab;
pub mod error;
pub mod populator;
pub mod processor;
pub mod registry;
pub mod schedules;

pub use crontab::CronExpression;
pub use error::{Result, SchedulerError};
pub use populator::{PeriodicPopulator, PopulationReport, PopulatorOptions};
pub use processor::{ProcessorOptions, TaskProcessor, TickReport};
pub use registry::{HandlerRegistry, TaskHandler};
pub use schedules::{next_planned_execution, ScheduleService};
