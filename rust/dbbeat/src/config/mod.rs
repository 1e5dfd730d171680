//! Configuration management for dbbeat.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/dbbeat.{toml,yaml,json}` when present
//! 3. An explicit file passed with `--config`
//! 4. `DBBEAT__SECTION__KEY` environment variables (a `.env` file is honoured)
//!
//! CLI flags are applied on top by the binary.

pub mod error;
pub mod validator;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load without validation.
    pub fn load_unchecked(path: Option<&str>) -> anyhow::Result<Self> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("scheduler.timezone", default_timezone())?
            .set_default("database.path", default_database_path())?
            .add_source(config::File::with_name("config/dbbeat").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(Path::new(path)).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("DBBEAT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// The configured scheduler timezone.
    pub fn timezone(&self) -> ConfigResult<Tz> {
        self.scheduler.timezone.parse::<Tz>().map_err(|e| {
            ConfigurationError::bad_value(
                format!(
                    "scheduler.timezone '{}' is not a known timezone: {e}",
                    self.scheduler.timezone
                ),
                "Use an IANA timezone name such as Asia/Shanghai or UTC",
            )
        })
    }
}

/// Beat loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone crontab schedules are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Longest sleep between ticks.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    /// How often run bookkeeping is written back.
    #[serde(default = "default_sync_every")]
    pub sync_every_secs: u64,
    /// Prefix of the Redis change-timestamp key.
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    /// Result expiry; enables the `celery.backend_cleanup` entry when set.
    #[serde(default = "default_result_expires")]
    pub result_expires_secs: Option<u64>,
    /// Queue used when an entry names none.
    #[serde(default = "default_queue")]
    pub default_queue: String,
    /// Seed the built-in beat table at startup.
    #[serde(default = "default_true")]
    pub seed_builtin: bool,
}

impl SchedulerConfig {
    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn sync_every(&self) -> Duration {
        Duration::from_secs(self.sync_every_secs)
    }

    pub fn result_expires(&self) -> Option<Duration> {
        self.result_expires_secs.map(Duration::from_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_interval_secs: default_max_interval(),
            sync_every_secs: default_sync_every(),
            redis_prefix: default_redis_prefix(),
            result_expires_secs: default_result_expires(),
            default_queue: default_queue(),
            seed_builtin: true,
        }
    }
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_max_interval() -> u64 {
    5
}

fn default_sync_every() -> u64 {
    180
}

fn default_redis_prefix() -> String {
    "fba:celery".to_string()
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an Option field")]
fn default_result_expires() -> Option<u64> {
    Some(86_400)
}

fn default_queue() -> String {
    "celery".to_string()
}

fn default_true() -> bool {
    true
}

/// SQLite schedule table location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "dbbeat.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Redis connection. Without a URL the change gate and task sink run in
/// process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
