use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tempo-daemon", version, about = "Deferred and periodic task runner")]
pub struct Cli {
    /// Path to tempo.toml (defaults to $TEMPO_CONFIG, then ~/.tempo/tempo.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run due tasks through the registered handlers
    Process {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Materialise tasks from active cron schedules
    Populate {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },
    /// Run the processor and the populator side by side
    Run,
    /// Add a one-off task and print its id
    Enqueue {
        task_type: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
        /// Earliest run time, RFC 3339 (default: now)
        #[arg(long)]
        eta: Option<DateTime<Utc>>,
        /// Task id (default: generated)
        #[arg(long)]
        id: Option<String>,
    },
    /// Manage periodic schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    Add {
        id: String,
        task_type: String,
        /// `min hour dom month dow [sec]`, e.g. "42 * * * *"
        #[arg(long)]
        cron: String,
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long, conflicts_with = "end_time")]
        max_executions: Option<u32>,
        /// RFC 3339
        #[arg(long)]
        end_time: Option<DateTime<Utc>>,
        /// Create the schedule switched off
        #[arg(long)]
        inactive: bool,
    },
    Activate {
        id: String,
    },
    Deactivate {
        id: String,
    },
    /// Print a schedule and its next planned execution
    Show {
        id: String,
    },
}
