use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tempo_core::config::ProcessorConfig;
use tempo_core::{Task, TaskStatus};
use tempo_store::TaskStore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::registry::HandlerRegistry;

/// How the processor loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    pub tick_interval: Duration,
    /// Run exactly one tick and return.
    pub one_shot: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            one_shot: false,
        }
    }
}

impl From<&ProcessorConfig> for ProcessorOptions {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            one_shot: config.one_shot,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks moved from `open` to `in_progress` by this tick.
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    /// Outcomes dropped because the record was no longer `in_progress`.
    pub discarded: usize,
    /// Claimed just as a stop arrived; ended `interrupted` without running.
    pub interrupted: usize,
}

/// Polls the task store for due tasks and runs them through the registry.
///
/// Ticks are synchronous (store access and handlers block); [`run`](Self::run)
/// moves each tick onto the blocking pool so that a stop request can be seen
/// while a handler is still running.
pub struct TaskProcessor<S> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    /// Snapshot of the task this process currently holds `in_progress`.
    in_flight: Mutex<Option<Task>>,
}

impl<S: TaskStore + 'static> TaskProcessor<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            in_flight: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run every open task with `eta <= now`, oldest eta first.
    ///
    /// A failing handler never aborts the tick; a store error does. `cancel`
    /// is checked between tasks and again after each claim: a task claimed
    /// after the stop is marked `interrupted` without running, and tasks not
    /// yet claimed stay `open`.
    pub fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<TickReport> {
        let mut report = TickReport::default();

        for mut task in self.store.due_tasks(now)? {
            if cancel.is_cancelled() {
                debug!(task_id = %task.id, "stop requested; leaving remaining tasks open");
                break;
            }

            task.transition(TaskStatus::InProgress)?;
            // Held before the claim is written so a stop landing right after
            // the claim still finds the task to interrupt.
            *self.in_flight() = Some(task.clone());
            let claimed = self.store.save_transition(&task, TaskStatus::Open);
            if !matches!(claimed, Ok(true)) {
                self.in_flight().take();
            }
            if !claimed? {
                debug!(task_id = %task.id, "task no longer open; skipped");
                continue;
            }
            report.claimed += 1;

            if cancel.is_cancelled() {
                self.in_flight().take();
                self.mark_interrupted(task)?;
                report.interrupted += 1;
                break;
            }

            let started = Instant::now();
            let outcome = self.registry.dispatch(&task);
            let elapsed = started.elapsed();

            let succeeded = match outcome {
                Ok(output) => {
                    task.complete(output, elapsed)?;
                    true
                }
                Err(failure) => {
                    task.fail(&failure)?;
                    false
                }
            };

            let saved = self.store.save_transition(&task, TaskStatus::InProgress);
            self.in_flight().take();

            if !saved? {
                warn!(task_id = %task.id, outcome = %task.status, "task was interrupted while running; outcome discarded");
                report.discarded += 1;
            } else if succeeded {
                info!(task_id = %task.id, duration_ms = elapsed.as_millis() as u64, "task done");
                report.done += 1;
            } else {
                let kind = task
                    .result
                    .as_ref()
                    .and_then(|r| r["kind"].as_str())
                    .unwrap_or_default();
                warn!(task_id = %task.id, %kind, task_type = %task.task_type, "task failed");
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Mark the task currently held by this process as `interrupted`.
    ///
    /// Returns the id of the task that was marked, if any. The handler may
    /// still be running; its outcome is discarded when it returns.
    pub fn interrupt_in_flight(&self) -> Result<Option<String>> {
        let Some(task) = self.in_flight().take() else {
            return Ok(None);
        };
        self.mark_interrupted(task)
    }

    fn mark_interrupted(&self, mut task: Task) -> Result<Option<String>> {
        task.transition(TaskStatus::Interrupted)?;
        if self.store.save_transition(&task, TaskStatus::InProgress)? {
            warn!(task_id = %task.id, "in-progress task marked interrupted");
            Ok(Some(task.id))
        } else {
            debug!(task_id = %task.id, "task no longer in progress; not interrupted");
            Ok(None)
        }
    }

    /// Main loop. Ticks every `tick_interval` until `cancel` fires, or once in
    /// one-shot mode.
    pub async fn run(self: Arc<Self>, options: ProcessorOptions, cancel: CancellationToken) {
        info!(
            interval_ms = options.tick_interval.as_millis() as u64,
            one_shot = options.one_shot,
            "task processor started"
        );

        if options.one_shot {
            Arc::clone(&self).run_tick(&cancel).await;
        } else {
            let mut interval = tokio::time::interval(options.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => Arc::clone(&self).run_tick(&cancel).await,
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        info!("task processor stopped");
    }

    async fn run_tick(self: Arc<Self>, cancel: &CancellationToken) {
        let worker = Arc::clone(&self);
        let token = cancel.clone();
        let mut tick = tokio::task::spawn_blocking(move || worker.tick(Utc::now(), &token));

        let joined = tokio::select! {
            joined = &mut tick => joined,
            _ = cancel.cancelled() => {
                let worker = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || worker.interrupt_in_flight()).await {
                    Ok(Err(e)) => error!("failed to mark in-progress task interrupted: {e}"),
                    Err(e) => error!("interrupt task aborted: {e}"),
                    Ok(Ok(_)) => {}
                }
                // A hung handler keeps us here until it returns.
                tick.await
            }
        };

        match joined.map_err(SchedulerError::from).and_then(|r| r) {
            Ok(report) if report.claimed > 0 => info!(
                claimed = report.claimed,
                done = report.done,
                failed = report.failed,
                discarded = report.discarded,
                interrupted = report.interrupted,
                "processor tick complete"
            ),
            Ok(_) => debug!("processor tick: nothing due"),
            Err(e) => {
                error!("task processor tick failed: {e}");
                if e.is_connectivity() {
                    if let Err(e) = self.store.reconnect() {
                        error!("task store reconnect failed: {e}");
                    }
                }
            }
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<Task>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempo_core::TaskFailure;
    use tempo_store::SqliteStore;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn processor(registry: HandlerRegistry) -> TaskProcessor<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskProcessor::new(store, Arc::new(registry))
    }

    #[test]
    fn tick_reports_outcomes() {
        let p = processor(
            HandlerRegistry::new()
                .with("ok", |_: &Task| Ok(json!("fine")))
                .with("bad", |_: &Task| Err(TaskFailure::new("bad", "nope"))),
        );
        p.store().create_task(&Task::new("a", at(9, 0), "ok", json!(null))).unwrap();
        p.store().create_task(&Task::new("b", at(9, 1), "bad", json!(null))).unwrap();
        p.store().create_task(&Task::new("c", at(9, 2), "missing", json!(null))).unwrap();
        p.store().create_task(&Task::new("later", at(11, 0), "ok", json!(null))).unwrap();

        let report = p.tick(at(10, 0), &CancellationToken::new()).unwrap();
        assert_eq!(
            report,
            TickReport { claimed: 3, done: 1, failed: 2, ..TickReport::default() }
        );

        let a = p.store().get_task("a").unwrap().unwrap();
        assert_eq!(a.status, TaskStatus::Done);
        assert_eq!(a.result, Some(json!("fine")));
        assert!(a.execution_duration.is_some());

        let c = p.store().get_task("c").unwrap().unwrap();
        assert_eq!(c.status, TaskStatus::Error);
        assert_eq!(c.result.unwrap()["kind"], "no_handler");

        let later = p.store().get_task("later").unwrap().unwrap();
        assert_eq!(later.status, TaskStatus::Open);
    }

    #[test]
    fn cancelled_tick_claims_nothing() {
        let p = processor(HandlerRegistry::new().with("ok", |_: &Task| Ok(json!(1))));
        p.store().create_task(&Task::new("a", at(9, 0), "ok", json!(null))).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(p.tick(at(10, 0), &cancel).unwrap(), TickReport::default());
        assert_eq!(p.store().get_task("a").unwrap().unwrap().status, TaskStatus::Open);
    }

    #[test]
    fn interrupt_without_in_flight_task_is_a_no_op() {
        let p = processor(HandlerRegistry::new());
        assert_eq!(p.interrupt_in_flight().unwrap(), None);
    }

    #[test]
    fn options_follow_config() {
        let config = ProcessorConfig { tick_interval_ms: 250, one_shot: true };
        let options = ProcessorOptions::from(&config);
        assert_eq!(options.tick_interval, Duration::from_millis(250));
        assert!(options.one_shot);
    }
}
