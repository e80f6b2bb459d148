//! Handlers every daemon ships with.

use serde_json::{json, Value};
use tempo_core::{Task, TaskFailure};
use tracing::info;

use crate::registry::{HandlerRegistry, TaskHandler};

/// Task type of [`LogHandler`].
pub const LOG_TASK_TYPE: &str = "log";

/// Writes the task payload to the log. Useful for smoke-testing schedules.
///
/// An optional `"message"` string in the payload is used as the log line.
pub struct LogHandler;

impl TaskHandler for LogHandler {
    fn handle(&self, task: &Task) -> Result<Value, TaskFailure> {
        let message = task
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("log task fired");
        info!(
            task_id = %task.id,
            periodic_parent = task.periodic_parent.as_deref().unwrap_or("-"),
            payload = %task.payload,
            "{message}"
        );
        Ok(json!({ "logged": message }))
    }
}

/// Register the built-in handlers on `registry`.
pub fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register(LOG_TASK_TYPE, LogHandler);
}
