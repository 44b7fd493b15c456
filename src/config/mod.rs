//! Typed configuration.
//!
//! Loads once at startup, fails fast on malformed values. Sources are
//! environment variables (`AUTORUN_*`, plus `OTEL_ENDPOINT`/`LOG_LEVEL`),
//! a TOML file, or any [`settings::SettingsProvider`].

pub mod settings;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::playback::PlaybackConfig;
use settings::{EnvSettings, SettingsProvider, parsed, seconds};

/// Prefix for environment settings.
pub const ENV_PREFIX: &str = "AUTORUN";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_name: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub event_bus: EventBusConfig,
    pub tasks: TaskManagerConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "autorun".to_string(),
            otel_endpoint: None,
            log_level: "info".to_string(),
            event_bus: EventBusConfig::default(),
            tasks: TaskManagerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_settings(&EnvSettings::new(ENV_PREFIX))?;
        config.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        Ok(config)
    }

    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self> {
        let config = Self {
            service_name: settings
                .get("service_name")
                .unwrap_or_else(|| "autorun".to_string()),
            event_bus: EventBusConfig::from_settings(settings)?,
            tasks: TaskManagerConfig::from_settings(settings)?,
            scheduler: SchedulerConfig::from_settings(settings)?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.event_bus.queue_capacity == 0, "event_bus.queue_capacity must be > 0"),
            (self.event_bus.async_workers == 0, "event_bus.async_workers must be > 0"),
            (self.tasks.workers == 0, "tasks.workers must be > 0"),
            (
                self.scheduler.poll_interval.is_zero(),
                "scheduler.poll_interval must be > 0",
            ),
            (
                self.scheduler.max_concurrent_executions == 0,
                "scheduler.max_concurrent_executions must be > 0",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Pending events beyond this are rejected with `QueueFull`.
    pub queue_capacity: usize,
    /// Concurrent async handler invocations.
    pub async_workers: usize,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            async_workers: 4,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl EventBusConfig {
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            queue_capacity: parsed(settings, "event_bus.queue_capacity")?
                .unwrap_or(defaults.queue_capacity),
            async_workers: parsed(settings, "event_bus.async_workers")?
                .unwrap_or(defaults.async_workers),
            shutdown_timeout: seconds(settings, "event_bus.shutdown_timeout_secs")?
                .unwrap_or(defaults.shutdown_timeout),
        })
    }
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Size of the `run_in_background` pool.
    pub workers: usize,
    /// Finished tasks kept for `get_status`.
    pub history_limit: usize,
    #[serde(with = "duration_secs")]
    pub history_max_age: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            history_limit: 100,
            history_max_age: Duration::from_secs(3600),
        }
    }
}

impl TaskManagerConfig {
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            workers: parsed(settings, "tasks.workers")?.unwrap_or(defaults.workers),
            history_limit: parsed(settings, "tasks.history_limit")?
                .unwrap_or(defaults.history_limit),
            history_max_age: seconds(settings, "tasks.history_max_age_secs")?
                .unwrap_or(defaults.history_max_age),
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// What a forced deactivation does to an in-flight execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedDeactivation {
    /// Stop the playback now and record the execution as cancelled.
    #[default]
    Cancel,
    /// Let the execution finish, then leave the schedule inactive.
    LetFinish,
}

impl std::str::FromStr for ForcedDeactivation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(ForcedDeactivation::Cancel),
            "let_finish" => Ok(ForcedDeactivation::LetFinish),
            other => Err(format!("expected \"cancel\" or \"let_finish\", got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub max_concurrent_executions: usize,
    /// Pause after a failed tick before the next one.
    #[serde(with = "duration_secs")]
    pub error_backoff: Duration,
    /// How long `stop()` waits for the loop to exit.
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,
    /// Finalized execution records kept in memory.
    pub history_limit: usize,
    /// Bound on each playback/repository call.
    #[serde(with = "duration_secs")]
    pub collaborator_timeout: Duration,
    pub forced_deactivation: ForcedDeactivation,
    pub playback: PlaybackConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_concurrent_executions: 3,
            error_backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            history_limit: 100,
            collaborator_timeout: Duration::from_secs(30),
            forced_deactivation: ForcedDeactivation::Cancel,
            playback: PlaybackConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &dyn SettingsProvider) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: seconds(settings, "scheduler.poll_interval_secs")?
                .unwrap_or(defaults.poll_interval),
            max_concurrent_executions: parsed(settings, "scheduler.max_concurrent_executions")?
                .unwrap_or(defaults.max_concurrent_executions),
            error_backoff: seconds(settings, "scheduler.error_backoff_secs")?
                .unwrap_or(defaults.error_backoff),
            stop_timeout: seconds(settings, "scheduler.stop_timeout_secs")?
                .unwrap_or(defaults.stop_timeout),
            history_limit: parsed(settings, "scheduler.history_limit")?
                .unwrap_or(defaults.history_limit),
            collaborator_timeout: seconds(settings, "scheduler.collaborator_timeout_secs")?
                .unwrap_or(defaults.collaborator_timeout),
            forced_deactivation: parsed(settings, "scheduler.forced_deactivation")?
                .unwrap_or(defaults.forced_deactivation),
            playback: PlaybackConfig {
                speed: parsed(settings, "playback.speed")?.unwrap_or(defaults.playback.speed),
                stop_on_error: parsed(settings, "playback.stop_on_error")?
                    .unwrap_or(defaults.playback.stop_on_error),
                action_delay_ms: parsed(settings, "playback.action_delay_ms")?
                    .unwrap_or(defaults.playback.action_delay_ms),
            },
        })
    }
}

/// Durations as (fractional) seconds in TOML.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
