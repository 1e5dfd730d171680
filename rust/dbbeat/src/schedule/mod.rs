//! Schedule definitions and evaluation.
//!
//! [`ScheduleSpec`] is the persisted row; [`ScheduleParams`] is the writable
//! subset accepted from seeds and the admin path. [`Schedule`] is the parsed,
//! timezone-bound evaluator built from a spec.

pub mod cron;
pub mod interval;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cron::{CrontabField, CrontabSpec, CrontabUnit, TzCrontab};
pub use interval::IntervalSchedule;

use crate::clock::Clock;
use crate::error::ValidationError;

/// Which field group of a row is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Interval,
    Crontab,
}

impl ScheduleKind {
    /// Integer stored in the `schedule_kind` column.
    pub const fn code(self) -> i64 {
        match self {
            Self::Interval => 0,
            Self::Crontab => 1,
        }
    }

    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Interval),
            1 => Some(Self::Crontab),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interval => "interval",
            Self::Crontab => "crontab",
        })
    }
}

/// Unit of an interval schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalPeriod {
    Days,
    Hours,
    Minutes,
    Seconds,
    Microseconds,
}

impl IntervalPeriod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Days => "days",
            Self::Hours => "hours",
            Self::Minutes => "minutes",
            Self::Seconds => "seconds",
            Self::Microseconds => "microseconds",
        }
    }

    /// `every` units of this period, or `None` on overflow.
    pub fn duration(self, every: i64) -> Option<Duration> {
        match self {
            Self::Days => Duration::try_days(every),
            Self::Hours => Duration::try_hours(every),
            Self::Minutes => Duration::try_minutes(every),
            Self::Seconds => Duration::try_seconds(every),
            Self::Microseconds => Some(Duration::microseconds(every)),
        }
    }
}

impl fmt::Display for IntervalPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "days" => Ok(Self::Days),
            "hours" => Ok(Self::Hours),
            "minutes" => Ok(Self::Minutes),
            "seconds" => Ok(Self::Seconds),
            "microseconds" => Ok(Self::Microseconds),
            other => Err(format!("unknown interval period `{other}`")),
        }
    }
}

/// Result of a due check: whether to run now, and seconds until the next check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleState {
    pub is_due: bool,
    pub next: f64,
}

impl ScheduleState {
    /// Delay reported for entries that will not run again.
    pub const NEVER: f64 = 1_000_000_000.0;

    pub const fn due(next: f64) -> Self {
        Self { is_due: true, next }
    }

    pub const fn not_due(next: f64) -> Self {
        Self {
            is_due: false,
            next,
        }
    }

    pub const fn never() -> Self {
        Self::not_due(Self::NEVER)
    }

    /// `next` as a sleepable duration.
    pub fn next_delay(&self) -> std::time::Duration {
        std::time::Duration::try_from_secs_f64(self.next.max(0.0))
            .unwrap_or(std::time::Duration::MAX)
    }
}

/// Parsed schedule bound to a timezone.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Interval(IntervalSchedule),
    Crontab(TzCrontab),
}

impl Schedule {
    pub fn is_due(&self, last_run_at: DateTime<Utc>, clock: &dyn Clock) -> ScheduleState {
        match self {
            Self::Interval(every) => every.is_due(last_run_at, clock.now()),
            Self::Crontab(cron) => cron.is_due(last_run_at, clock),
        }
    }
}

/// Message expiry forwarded to the task sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expires {
    /// Expire this many seconds after the message is sent.
    Seconds(i64),
    /// Expire at a fixed instant.
    At(DateTime<Utc>),
}

/// A persisted schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: i64,
    pub name: String,
    pub task: String,
    /// JSON array text.
    pub args: Option<String>,
    /// JSON object text.
    pub kwargs: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub expire_time: Option<DateTime<Utc>>,
    pub expire_seconds: Option<i64>,
    pub kind: ScheduleKind,
    pub interval_every: Option<i64>,
    pub interval_period: Option<IntervalPeriod>,
    pub crontab: CrontabSpec,
    pub one_off: bool,
    pub enabled: bool,
    pub total_run_count: i64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
}

impl ScheduleSpec {
    /// New enabled row built from validated params.
    pub fn from_params(id: i64, params: &ScheduleParams, now: DateTime<Utc>) -> Self {
        let mut spec = Self {
            id,
            name: params.name.clone(),
            task: String::new(),
            args: None,
            kwargs: None,
            queue: None,
            exchange: None,
            routing_key: None,
            start_time: None,
            expire_time: None,
            expire_seconds: None,
            kind: params.kind,
            interval_every: None,
            interval_period: None,
            crontab: CrontabSpec::default(),
            one_off: false,
            enabled: true,
            total_run_count: 0,
            last_run_time: None,
            remark: params.remark.clone(),
            created_time: now,
            updated_time: None,
        };
        spec.apply_definition(params);
        spec
    }

    /// Overwrite the schedule-relevant fields. Name, counters, `enabled` and
    /// `remark` are left alone.
    pub fn apply_definition(&mut self, params: &ScheduleParams) {
        self.task.clone_from(&params.task);
        self.args = params.args_text();
        self.kwargs = params.kwargs_text();
        self.queue.clone_from(&params.queue);
        self.exchange.clone_from(&params.exchange);
        self.routing_key.clone_from(&params.routing_key);
        self.start_time = params.start_time;
        self.expire_time = params.expire_time;
        self.expire_seconds = params.expire_seconds;
        self.kind = params.kind;
        self.interval_every = params.interval_every;
        self.interval_period = params.interval_period;
        self.crontab.clone_from(&params.crontab);
        self.one_off = params.one_off;
    }

    /// Overwrite every writable field, including name and remark.
    pub fn apply_params(&mut self, params: &ScheduleParams) {
        self.apply_definition(params);
        self.name.clone_from(&params.name);
        self.remark.clone_from(&params.remark);
    }

    /// Build the evaluator this row describes.
    pub fn schedule(&self, tz: Tz) -> Result<Schedule, ValidationError> {
        match self.kind {
            ScheduleKind::Interval => {
                let every = self.interval_every.ok_or(ValidationError::MissingField {
                    kind: self.kind,
                    field: "interval_every",
                })?;
                let period = self.interval_period.ok_or(ValidationError::MissingField {
                    kind: self.kind,
                    field: "interval_period",
                })?;
                Ok(Schedule::Interval(IntervalSchedule::new(every, period)?))
            }
            ScheduleKind::Crontab => Ok(Schedule::Crontab(TzCrontab::new(&self.crontab, tz)?)),
        }
    }

    /// Message expiry, preferring the relative form.
    pub fn expires(&self) -> Option<Expires> {
        self.expire_seconds
            .map(Expires::Seconds)
            .or(self.expire_time.map(Expires::At))
    }
}

/// Writable schedule fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleParams {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub kwargs: Option<Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expire_seconds: Option<i64>,
    pub kind: ScheduleKind,
    #[serde(default)]
    pub interval_every: Option<i64>,
    #[serde(default)]
    pub interval_period: Option<IntervalPeriod>,
    #[serde(default)]
    pub crontab: CrontabSpec,
    #[serde(default)]
    pub one_off: bool,
    #[serde(default)]
    pub remark: Option<String>,
}

impl ScheduleParams {
    fn base(name: impl Into<String>, task: impl Into<String>, kind: ScheduleKind) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            args: None,
            kwargs: None,
            queue: None,
            exchange: None,
            routing_key: None,
            start_time: None,
            expire_time: None,
            expire_seconds: None,
            kind,
            interval_every: None,
            interval_period: None,
            crontab: CrontabSpec::default(),
            one_off: false,
            remark: None,
        }
    }

    pub fn interval(
        name: impl Into<String>,
        task: impl Into<String>,
        every: i64,
        period: IntervalPeriod,
    ) -> Self {
        Self {
            interval_every: Some(every),
            interval_period: Some(period),
            ..Self::base(name, task, ScheduleKind::Interval)
        }
    }

    pub fn crontab(name: impl Into<String>, task: impl Into<String>, crontab: CrontabSpec) -> Self {
        Self {
            crontab,
            ..Self::base(name, task, ScheduleKind::Crontab)
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: Value) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    /// Reject definitions that must never reach storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.task.trim().is_empty() {
            return Err(ValidationError::EmptyTask);
        }
        if self.expire_time.is_some() && self.expire_seconds.is_some() {
            return Err(ValidationError::ExpiryConflict);
        }

        match self.kind {
            ScheduleKind::Interval => {
                let every = self.interval_every.ok_or(ValidationError::MissingField {
                    kind: self.kind,
                    field: "interval_every",
                })?;
                let period = self.interval_period.ok_or(ValidationError::MissingField {
                    kind: self.kind,
                    field: "interval_period",
                })?;
                IntervalSchedule::new(every, period)?;
            }
            ScheduleKind::Crontab => self.crontab.validate()?,
        }

        if self
            .args
            .as_ref()
            .is_some_and(|args| !(args.is_array() || args.is_null()))
        {
            return Err(ValidationError::InvalidPayload {
                field: "args",
                reason: "expected a JSON array".to_string(),
            });
        }
        if self
            .kwargs
            .as_ref()
            .is_some_and(|kwargs| !(kwargs.is_object() || kwargs.is_null()))
        {
            return Err(ValidationError::InvalidPayload {
                field: "kwargs",
                reason: "expected a JSON object".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn args_text(&self) -> Option<String> {
        payload_text(self.args.as_ref())
    }

    pub(crate) fn kwargs_text(&self) -> Option<String> {
        payload_text(self.kwargs.as_ref())
    }
}

fn payload_text(value: Option<&Value>) -> Option<String> {
    value.filter(|v| !v.is_null()).map(Value::to_string)
}
