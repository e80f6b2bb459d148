use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tempo_core::{Task, TaskFailure};
use tracing::{debug, warn};

/// Executable logic for one task type.
///
/// Handlers run synchronously on the processor's blocking thread. A handler
/// that never returns blocks its tick (and shutdown) indefinitely.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &Task) -> Result<Value, TaskFailure>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> Result<Value, TaskFailure> + Send + Sync,
{
    fn handle(&self, task: &Task) -> Result<Value, TaskFailure> {
        self(task)
    }
}

/// Maps a task-type tag to an ordered list of handlers.
///
/// Built once at startup and handed to the processor; there is no global
/// subscriber state.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `task_type`. Handlers for the same
    /// type run in registration order.
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> &mut Self {
        let task_type = task_type.into();
        debug!(%task_type, "handler registered");
        self.handlers
            .entry(task_type)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn handlers_for(&self, task_type: &str) -> &[Arc<dyn TaskHandler>] {
        self.handlers.get(task_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Run every handler registered for `task.task_type`, in order.
    ///
    /// The first failure short-circuits the rest and is returned as-is. No
    /// registered handler is a `no_handler` failure; a panicking handler is a
    /// `panic` failure. On success the output is the single handler's value,
    /// or an array of outputs when several handlers are registered.
    pub fn dispatch(&self, task: &Task) -> Result<Value, TaskFailure> {
        let handlers = self.handlers_for(&task.task_type);
        if handlers.is_empty() {
            return Err(TaskFailure::no_handler(&task.task_type));
        }

        let mut outputs = Vec::with_capacity(handlers.len());
        for (index, handler) in handlers.iter().enumerate() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(task)))
                .unwrap_or_else(|payload| Err(panic_failure(payload.as_ref())));
            match outcome {
                Ok(output) => outputs.push(output),
                Err(failure) => {
                    if handlers.len() > 1 {
                        debug!(
                            task_id = %task.id,
                            handler = index,
                            skipped = handlers.len() - index - 1,
                            "handler failed; remaining handlers skipped"
                        );
                    }
                    return Err(failure);
                }
            }
        }

        if outputs.len() == 1 {
            Ok(outputs.pop().unwrap_or_default())
        } else {
            Ok(Value::Array(outputs))
        }
    }
}

fn panic_failure(payload: &(dyn Any + Send)) -> TaskFailure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    warn!("task handler panicked: {message}");
    TaskFailure::new("panic", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    fn task(task_type: &str) -> Task {
        Task::new("t1", Utc::now(), task_type, json!({"n": 2}))
    }

    #[test]
    fn single_handler_output_is_the_result() {
        let registry = HandlerRegistry::new().with("double", |t: &Task| {
            Ok(json!(t.payload["n"].as_i64().unwrap_or(0) * 2))
        });
        assert_eq!(registry.dispatch(&task("double")), Ok(json!(4)));
    }

    #[test]
    fn missing_handler_is_a_no_handler_failure() {
        let registry = HandlerRegistry::new();
        let failure = registry.dispatch(&task("unknown")).unwrap_err();
        assert_eq!(failure.kind, "no_handler");
        assert_eq!(failure.detail["type"], "unknown");
    }

    #[test]
    fn handlers_run_in_order_and_first_failure_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (calls.clone(), calls.clone(), calls.clone());
        let registry = HandlerRegistry::new()
            .with("multi", move |_: &Task| {
                a.lock().unwrap().push("first");
                Ok(json!(1))
            })
            .with("multi", move |_: &Task| {
                b.lock().unwrap().push("second");
                Err(TaskFailure::new("boom", "second failed").with_detail(json!(["x"])))
            })
            .with("multi", move |_: &Task| {
                c.lock().unwrap().push("third");
                Ok(json!(3))
            });

        let failure = registry.dispatch(&task("multi")).unwrap_err();
        assert_eq!(failure.kind, "boom");
        assert_eq!(failure.detail, json!(["x"]));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn several_successful_handlers_yield_an_array() {
        let registry = HandlerRegistry::new()
            .with("multi", |_: &Task| Ok(json!("a")))
            .with("multi", |_: &Task| Ok(json!("b")));
        assert_eq!(registry.dispatch(&task("multi")), Ok(json!(["a", "b"])));
        assert_eq!(registry.handlers_for("multi").len(), 2);
        assert_eq!(registry.task_types(), vec!["multi"]);
    }

    #[test]
    fn panicking_handler_becomes_a_failure() {
        let registry = HandlerRegistry::new().with("panics", |_: &Task| -> Result<Value, TaskFailure> {
            panic!("kaboom")
        });
        let failure = registry.dispatch(&task("panics")).unwrap_err();
        assert_eq!(failure.kind, "panic");
        assert_eq!(failure.message, "kaboom");
    }
}
