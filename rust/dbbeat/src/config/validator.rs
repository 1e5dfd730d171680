//! Startup validation of the loaded configuration.
//!
//! All problems are collected so the operator sees every one of them at once.

use super::AppConfig;
use super::error::{ConfigResult, ConfigurationError};

/// Checks a loaded [`AppConfig`] before anything is started.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Returns `Ok(())` if valid, or a `ConfigurationError` with all issues.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = config.timezone() {
            errors.push(e);
        }
        if let Err(e) = Self::validate_scheduler(config) {
            match e {
                ConfigurationError::Several(errs) => errors.extend(errs),
                e => errors.push(e),
            }
        }
        if let Err(e) = Self::validate_database(config) {
            errors.push(e);
        }
        if let Err(e) = Self::validate_redis(config) {
            errors.push(e);
        }

        ConfigurationError::from_errors(errors).map_or(Ok(()), Err)
    }

    pub fn validate_scheduler(config: &AppConfig) -> ConfigResult<()> {
        let scheduler = &config.scheduler;
        let mut errors = Vec::new();

        if scheduler.max_interval_secs == 0 {
            errors.push(ConfigurationError::bad_value(
                "scheduler.max_interval_secs must be greater than zero",
                "Set DBBEAT__SCHEDULER__MAX_INTERVAL_SECS to a positive number of seconds (default 5)",
            ));
        }
        if scheduler.redis_prefix.trim().is_empty() {
            errors.push(ConfigurationError::bad_value(
                "scheduler.redis_prefix is empty",
                "Set DBBEAT__SCHEDULER__REDIS_PREFIX, e.g. fba:celery",
            ));
        }
        if scheduler.default_queue.trim().is_empty() {
            errors.push(ConfigurationError::bad_value(
                "scheduler.default_queue is empty",
                "Set DBBEAT__SCHEDULER__DEFAULT_QUEUE, e.g. celery",
            ));
        }

        ConfigurationError::from_errors(errors).map_or(Ok(()), Err)
    }

    pub fn validate_database(config: &AppConfig) -> ConfigResult<()> {
        let path = config.database.path.trim();
        if path.is_empty() {
            return Err(ConfigurationError::unset(
                "database.path",
                "the schedule table",
                "DBBEAT__DATABASE__PATH or --database",
            ));
        }
        if path == ":memory:" {
            return Err(ConfigurationError::bad_value(
                "database.path ':memory:' is not supported",
                "Every store operation opens its own connection; use a file path",
            ));
        }
        Ok(())
    }

    pub fn validate_redis(config: &AppConfig) -> ConfigResult<()> {
        let Some(url) = config.redis.url.as_deref() else {
            tracing::warn!(
                "Redis not configured. \
                Schedule changes from other processes will not be detected and tasks are only logged."
            );
            return Ok(());
        };

        if url.starts_with("redis://") || url.starts_with("rediss://") || url.starts_with("unix://") {
            Ok(())
        } else {
            Err(ConfigurationError::bad_value(
                format!("redis.url '{url}' is not a Redis URL"),
                "Use redis://host:port/db, rediss:// for TLS, or unix:///path/to/socket",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        tokio_test::assert_ok!(ConfigValidator::validate(&AppConfig::default()));
    }

    #[test]
    fn test_collects_every_problem() {
        let mut config = AppConfig::default();
        config.scheduler.timezone = "Mars/Olympus".to_string();
        config.scheduler.max_interval_secs = 0;
        config.scheduler.default_queue = " ".to_string();
        config.database.path = String::new();
        config.redis.url = Some("http://localhost:6379".to_string());

        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.count(), 5);
        let msg = err.to_string();
        assert!(msg.contains("Mars/Olympus"));
        assert!(msg.contains("max_interval_secs"));
        assert!(msg.contains("database.path"));
        assert!(msg.contains("not a Redis URL"));
    }

    #[test]
    fn test_memory_database_rejected() {
        let mut config = AppConfig::default();
        config.database.path = ":memory:".to_string();
        assert!(matches!(
            ConfigValidator::validate_database(&config),
            Err(ConfigurationError::BadValue { .. })
        ));
    }

    #[test]
    fn test_redis_schemes() {
        let mut config = AppConfig::default();
        for url in ["redis://localhost:6379/0", "rediss://cache:6380", "unix:///tmp/redis.sock"] {
            config.redis.url = Some(url.to_string());
            assert!(ConfigValidator::validate_redis(&config).is_ok(), "{url}");
        }
    }
}
