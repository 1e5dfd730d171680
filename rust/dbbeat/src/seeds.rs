//! Static beat definitions seeded into the schedule table at startup.
//!
//! Seeding goes through [`crate::entry::ScheduleEntry::from_entry`], which
//! inserts missing rows and refreshes the schedule-relevant fields of
//! existing ones without touching their counters, `enabled` flag or remark.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::schedule::{CrontabSpec, IntervalPeriod, ScheduleParams};

/// Name of the result-backend cleanup entry.
pub const BACKEND_CLEANUP: &str = "celery.backend_cleanup";

/// Seed table: schedule name to definition.
pub type BeatTable = BTreeMap<String, BeatDefinition>;

/// When a seeded schedule fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeatSchedule {
    Interval { every: i64, period: IntervalPeriod },
    Crontab(CrontabSpec),
}

/// Message expiry as written in a seed definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedExpiry {
    /// Stored as `expire_seconds`.
    Seconds(i64),
    /// Stored as `expire_time = now + delta` when the seed is applied.
    After(Duration),
    /// Stored as `expire_time`.
    At(DateTime<Utc>),
}

/// Optional seed settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeatOptions {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub expires: Option<SeedExpiry>,
    pub one_off: bool,
}

/// One statically configured periodic task.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatDefinition {
    pub task: String,
    pub schedule: BeatSchedule,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub options: BeatOptions,
}

impl BeatDefinition {
    pub fn new(task: impl Into<String>, schedule: BeatSchedule) -> Self {
        Self {
            task: task.into(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            options: BeatOptions::default(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: BeatOptions) -> Self {
        self.options = options;
        self
    }

    /// Row fields for this definition under `name`. Empty args and kwargs
    /// are stored as NULL.
    pub fn to_params(&self, name: &str, now: DateTime<Utc>) -> ScheduleParams {
        let mut params = match &self.schedule {
            BeatSchedule::Interval { every, period } => {
                ScheduleParams::interval(name, &self.task, *every, *period)
            }
            BeatSchedule::Crontab(crontab) => {
                ScheduleParams::crontab(name, &self.task, crontab.clone())
            }
        };

        if !self.args.is_empty() {
            params.args = Some(Value::Array(self.args.clone()));
        }
        if !self.kwargs.is_empty() {
            params.kwargs = Some(Value::Object(self.kwargs.clone()));
        }

        let options = &self.options;
        params.queue.clone_from(&options.queue);
        params.exchange.clone_from(&options.exchange);
        params.routing_key.clone_from(&options.routing_key);
        params.start_time = options.start_time;
        params.one_off = options.one_off;
        match options.expires {
            Some(SeedExpiry::Seconds(seconds)) => params.expire_seconds = Some(seconds),
            Some(SeedExpiry::After(delta)) => params.expire_time = Some(now + delta),
            Some(SeedExpiry::At(instant)) => params.expire_time = Some(instant),
            None => {}
        }
        params
    }
}

/// Daily result-backend cleanup at 04:00, expiring after 12 hours.
pub fn backend_cleanup() -> (String, BeatDefinition) {
    let definition = BeatDefinition::new(
        BACKEND_CLEANUP,
        BeatSchedule::Crontab(CrontabSpec::at("0", "4")),
    )
    .with_options(BeatOptions {
        expires: Some(SeedExpiry::Seconds(12 * 3600)),
        ..BeatOptions::default()
    });
    (BACKEND_CLEANUP.to_string(), definition)
}

/// Built-in periodic jobs of the host application.
pub fn default_beat_schedule() -> BeatTable {
    let mut table = BeatTable::new();
    table.insert(
        "Clean operation logs".to_string(),
        BeatDefinition::new(
            "backend.app.task.tasks.db_log.tasks.delete_db_opera_log",
            BeatSchedule::Crontab(CrontabSpec::at("0", "0").with_day_of_week("6")),
        ),
    );
    table.insert(
        "Clean login logs".to_string(),
        BeatDefinition::new(
            "backend.app.task.tasks.db_log.tasks.delete_db_login_log",
            BeatSchedule::Crontab(CrontabSpec::at("0", "0").with_day_of_month("15")),
        ),
    );
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKind;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_default_table_is_valid() {
        let now = Utc::now();
        let table = default_beat_schedule();
        assert_eq!(table.len(), 2);
        for (name, definition) in &table {
            let params = definition.to_params(name, now);
            assert!(params.validate().is_ok(), "{name} should validate");
            assert_eq!(params.kind, ScheduleKind::Crontab);
        }
        let login = &table["Clean login logs"];
        assert_eq!(
            login.schedule,
            BeatSchedule::Crontab(CrontabSpec::at("0", "0").with_day_of_month("15"))
        );
    }

    #[test]
    fn test_backend_cleanup_definition() {
        let (name, definition) = backend_cleanup();
        let params = definition.to_params(&name, Utc::now());
        assert_eq!(params.name, "celery.backend_cleanup");
        assert_eq!(params.crontab.minute, "0");
        assert_eq!(params.crontab.hour, "4");
        assert_eq!(params.expire_seconds, Some(43_200));
        assert_eq!(params.expire_time, None);
    }

    #[test]
    fn test_to_params_payloads_and_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let definition = BeatDefinition::new(
            "app.tasks.task_demo_params",
            BeatSchedule::Interval {
                every: 30,
                period: IntervalPeriod::Seconds,
            },
        )
        .with_args(vec![json!("Hello,")])
        .with_kwargs(json!({"world": "World"}).as_object().cloned().unwrap())
        .with_options(BeatOptions {
            queue: Some("demo".to_string()),
            expires: Some(SeedExpiry::After(Duration::minutes(10))),
            ..BeatOptions::default()
        });

        let params = definition.to_params("Demo", now);
        assert_eq!(params.args, Some(json!(["Hello,"])));
        assert_eq!(params.kwargs, Some(json!({"world": "World"})));
        assert_eq!(params.queue.as_deref(), Some("demo"));
        assert_eq!(params.expire_time, Some(now + Duration::minutes(10)));

        let bare = BeatDefinition::new("app.noop", BeatSchedule::Crontab(CrontabSpec::default()));
        let params = bare.to_params("noop", now);
        assert_eq!(params.args, None);
        assert_eq!(params.kwargs, None);
    }
}
