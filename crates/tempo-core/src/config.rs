use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Top-level config (tempo.toml + TEMPO_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TempoConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub populator: PopulatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Run a single tick and exit.
    #[serde(default)]
    pub one_shot: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            one_shot: false,
        }
    }
}

impl ProcessorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulatorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Move every active schedule's cursor to "now" when the populator starts,
    /// so occurrences missed while it was down are not backfilled.
    #[serde(default = "bool_true")]
    pub fast_forward_on_startup: bool,
}

impl Default for PopulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            fast_forward_on_startup: true,
        }
    }
}

impl PopulatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn bool_true() -> bool {
    true
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.db", home)
}

impl TempoConfig {
    /// Load config from a TOML file with TEMPO_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TEMPO_PROCESSOR__TICK_INTERVAL_MS=250`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::TempoError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TEMPO_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tempo/tempo.toml", home)
}
