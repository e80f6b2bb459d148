use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, TempoError};

/// Lifecycle state of a single deferred task.
///
/// The only legal path is `Open -> InProgress -> {Done, Error, Interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its eta.
    Open,
    /// Claimed by a processor; a handler is (or was) running.
    InProgress,
    /// Every handler returned successfully.
    Done,
    /// A handler failed, or no handler was registered for the type.
    Error,
    /// The processor was stopped while the task was in progress.
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Interrupted
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Open, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Error)
                | (TaskStatus::InProgress, TaskStatus::Interrupted)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "in_progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "error" => Ok(TaskStatus::Error),
            "interrupted" => Ok(TaskStatus::Interrupted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Structured failure recorded into a task's `result` when it ends in `error`.
///
/// `kind` is a stable machine-readable tag (`no_handler`, `panic`, or whatever
/// the handler chose); `detail` carries arbitrary arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn no_handler(task_type: &str) -> Self {
        Self::new(
            "no_handler",
            format!("no handler registered for task type '{task_type}'"),
        )
        .with_detail(serde_json::json!({ "type": task_type }))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "message": self.message,
            "detail": self.detail,
        })
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Caller-chosen, globally unique.
    pub id: String,
    /// Earliest instant the task may run. Never changes after creation.
    /// Kept to microsecond precision, the resolution the store persists.
    pub eta: DateTime<Utc>,
    /// Handler registry key.
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    /// Handler output on `done`, a serialised [`TaskFailure`] on `error`.
    pub result: Option<serde_json::Value>,
    /// Wall-clock handler time, set when the task reaches `done`.
    pub execution_duration: Option<Duration>,
    /// Id of the schedule that materialised this task, if any.
    pub periodic_parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh `open` task. `eta` is truncated to whole microseconds.
    pub fn new(
        id: impl Into<String>,
        eta: DateTime<Utc>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            eta: eta.trunc_subsecs(6),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::Open,
            result: None,
            execution_duration: None,
            periodic_parent: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Generate a time-sortable identifier for callers that have none.
    pub fn generate_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// Move to `next`, refusing anything outside the status machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TempoError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a successful run and move to `done`.
    pub fn complete(&mut self, output: serde_json::Value, elapsed: Duration) -> Result<()> {
        self.transition(TaskStatus::Done)?;
        self.result = Some(output);
        self.execution_duration = Some(elapsed);
        Ok(())
    }

    /// Record a handler failure and move to `error`.
    pub fn fail(&mut self, failure: &TaskFailure) -> Result<()> {
        self.transition(TaskStatus::Error)?;
        self.result = Some(failure.to_value());
        Ok(())
    }
}

/// Why a schedule stopped producing tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleLimit {
    /// The schedule already owns `limit` tasks.
    MaxExecutions { limit: u32 },
    /// The next occurrence lies after `end_time`.
    EndTime { end_time: DateTime<Utc> },
}

impl fmt::Display for ScheduleLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleLimit::MaxExecutions { limit } => {
                write!(f, "max_number_of_executions ({limit}) reached")
            }
            ScheduleLimit::EndTime { end_time } => {
                write!(f, "end_time ({}) passed", end_time.to_rfc3339())
            }
        }
    }
}

/// A recurring template that materialises [`Task`]s from a cron expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTask {
    pub id: String,
    pub task_type: String,
    /// Copied verbatim into each materialised task's payload.
    pub payload_template: serde_json::Value,
    pub cron_expression: String,
    pub is_active: bool,
    /// Mutually exclusive with `end_time`.
    pub max_number_of_executions: Option<u32>,
    /// Mutually exclusive with `max_number_of_executions`.
    pub end_time: Option<DateTime<Utc>>,
    /// Occurrences up to and including this instant have been materialised.
    pub last_population: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeriodicTask {
    /// An active schedule whose cursor starts at `now`.
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        cron_expression: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload_template: serde_json::Value::Null,
            cron_expression: cron_expression.into(),
            is_active: true,
            max_number_of_executions: None,
            end_time: None,
            last_population: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload_template = payload;
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_number_of_executions = Some(max);
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// The limit that forbids materialising `occurrence`, given the number of
    /// tasks this schedule already owns.
    pub fn limit_for(&self, occurrence: DateTime<Utc>, children: u64) -> Option<ScheduleLimit> {
        if let Some(limit) = self.max_number_of_executions {
            if children >= u64::from(limit) {
                return Some(ScheduleLimit::MaxExecutions { limit });
            }
        }
        match self.end_time {
            Some(end_time) if occurrence > end_time => Some(ScheduleLimit::EndTime { end_time }),
            _ => None,
        }
    }

    /// Deterministic id of the task materialised for `occurrence`.
    pub fn task_id_for(&self, occurrence: DateTime<Utc>) -> String {
        format!("{} ({})", self.id, occurrence.format("%Y-%m-%d %H:%M:%S%z"))
    }

    /// Build the open task for `occurrence`.
    pub fn materialize(&self, occurrence: DateTime<Utc>) -> Task {
        let mut task = Task::new(
            self.task_id_for(occurrence),
            occurrence,
            self.task_type.clone(),
            self.payload_template.clone(),
        );
        task.periodic_parent = Some(self.id.clone());
        task
    }

    /// Apply an operator-driven activation change.
    ///
    /// Reactivation moves the cursor to `now`: occurrences missed while the
    /// schedule was inactive are never backfilled.
    pub fn apply_activation(&mut self, change: ActivationChange, now: DateTime<Utc>) {
        self.is_active = change.new;
        if change.is_reactivation() {
            self.last_population = now;
        }
    }
}

/// An explicit `is_active` flip, passed to the schedule update path instead of
/// comparing against a shadow copy of the previous record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationChange {
    pub previous: bool,
    pub new: bool,
}

impl ActivationChange {
    pub fn new(previous: bool, new: bool) -> Self {
        Self { previous, new }
    }

    pub fn is_reactivation(&self) -> bool {
        !self.previous && self.new
    }

    pub fn is_deactivation(&self) -> bool {
        self.previous && !self.new
    }
}
