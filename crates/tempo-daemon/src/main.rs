use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tempo_core::config::TempoConfig;
use tempo_core::{PeriodicTask, Task};
use tempo_scheduler::builtin::register_builtins;
use tempo_scheduler::{
    HandlerRegistry, PeriodicPopulator, PopulatorOptions, ProcessorOptions, ScheduleService,
    TaskProcessor,
};
use tempo_store::{SqliteStore, TaskStore};
use tracing::info;

mod cli;
mod signal;

use cli::{Cli, Command, ScheduleCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_daemon=info,tempo_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > TEMPO_CONFIG env > ~/.tempo/tempo.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("TEMPO_CONFIG").ok());
    let config = TempoConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        TempoConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    let store = Arc::new(
        SqliteStore::open(db_path).with_context(|| format!("opening database {db_path}"))?,
    );

    match cli.command {
        Command::Process { once } => {
            let mut options = ProcessorOptions::from(&config.processor);
            options.one_shot |= once;
            let cancel = signal::shutdown_token();
            build_processor(store).run(options, cancel).await;
        }
        Command::Populate { once } => {
            let mut options = PopulatorOptions::from(&config.populator);
            options.one_shot = once;
            let cancel = signal::shutdown_token();
            Arc::new(PeriodicPopulator::new(store)).run(options, cancel).await;
        }
        Command::Run => {
            let cancel = signal::shutdown_token();
            let processor = tokio::spawn(build_processor(Arc::clone(&store)).run(
                ProcessorOptions {
                    one_shot: false,
                    ..ProcessorOptions::from(&config.processor)
                },
                cancel.clone(),
            ));
            let populator = tokio::spawn(
                Arc::new(PeriodicPopulator::new(store))
                    .run(PopulatorOptions::from(&config.populator), cancel),
            );
            let (processed, populated) = tokio::join!(processor, populator);
            processed.context("task processor panicked")?;
            populated.context("periodic populator panicked")?;
        }
        Command::Enqueue {
            task_type,
            payload,
            eta,
            id,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be JSON")?;
            let task = Task::new(
                id.unwrap_or_else(Task::generate_id),
                eta.unwrap_or_else(Utc::now),
                task_type,
                payload,
            );
            store.create_task(&task)?;
            info!(task_id = %task.id, eta = %task.eta, "task enqueued");
            println!("{}", task.id);
        }
        Command::Schedule { action } => schedule(ScheduleService::new(store), action)?,
    }

    Ok(())
}

fn build_processor(store: Arc<SqliteStore>) -> Arc<TaskProcessor<SqliteStore>> {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);
    info!(task_types = ?registry.task_types(), "handlers registered");
    Arc::new(TaskProcessor::new(store, Arc::new(registry)))
}

fn schedule(service: ScheduleService<SqliteStore>, action: ScheduleCommand) -> anyhow::Result<()> {
    let now = Utc::now();
    let schedule = match action {
        ScheduleCommand::Add {
            id,
            task_type,
            cron,
            payload,
            max_executions,
            end_time,
            inactive,
        } => {
            let mut schedule = PeriodicTask::new(id, task_type, cron, now).with_payload(
                serde_json::from_str(&payload).context("payload must be JSON")?,
            );
            schedule.max_number_of_executions = max_executions;
            schedule.end_time = end_time;
            schedule.is_active = !inactive;
            service.create(schedule)?
        }
        ScheduleCommand::Activate { id } => service.set_active(&id, true, now)?,
        ScheduleCommand::Deactivate { id } => service.set_active(&id, false, now)?,
        ScheduleCommand::Show { id } => service
            .get(&id)?
            .with_context(|| format!("no schedule with id '{id}'"))?,
    };

    let next = service.next_planned_execution(&schedule.id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "schedule": schedule,
            "next_planned_execution": next,
        }))?
    );
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
