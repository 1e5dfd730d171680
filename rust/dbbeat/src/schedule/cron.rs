//! Crontab parsing and timezone-aware evaluation.
//!
//! A crontab is stored as five independent field expressions (`minute`,
//! `hour`, `day_of_week`, `day_of_month`, `month_of_year`). Each field
//! accepts:
//!
//! - `*` (every value)
//! - single values and comma lists (`0,15,30`)
//! - ranges (`9-17`); a range whose start exceeds its end wraps around the
//!   field (`fri-mon`, `22-2`)
//! - steps over `*` or a range (`*/15`, `10-40/10`); a step longer than
//!   the span keeps only its first value
//! - three-letter day names for `day_of_week` (Sunday is 0) and month names
//!   for `month_of_year`
//!
//! Day-of-month and day-of-week must both match for a date to fire.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::ScheduleState;
use crate::clock::Clock;
use crate::error::ValidationError;

/// How far ahead to search for a matching date before giving up.
///
/// Covers a full leap-year/weekday cycle so that rare combinations such as
/// "29 February on a Monday" are still found.
const MAX_MONTHS_AHEAD: u32 = 12 * 30;

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// One of the five crontab fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrontabUnit {
    Minute,
    Hour,
    DayOfWeek,
    DayOfMonth,
    MonthOfYear,
}

impl CrontabUnit {
    /// Inclusive bounds of the field.
    pub const fn bounds(self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfWeek => (0, 6),
            Self::DayOfMonth => (1, 31),
            Self::MonthOfYear => (1, 12),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfWeek => "day_of_week",
            Self::DayOfMonth => "day_of_month",
            Self::MonthOfYear => "month_of_year",
        }
    }

    fn named_value(self, token: &str) -> Option<u32> {
        let token = token.to_ascii_lowercase();
        let (names, offset): (&[&str], usize) = match self {
            Self::DayOfWeek => (&DAY_NAMES, 0),
            Self::MonthOfYear => (&MONTH_NAMES, 1),
            _ => return None,
        };
        names
            .iter()
            .position(|name| *name == token)
            .and_then(|idx| u32::try_from(idx + offset).ok())
    }
}

impl fmt::Display for CrontabUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw crontab field expressions as stored on a schedule row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabSpec {
    pub minute: String,
    pub hour: String,
    pub day_of_week: String,
    pub day_of_month: String,
    pub month_of_year: String,
}

impl Default for CrontabSpec {
    fn default() -> Self {
        Self {
            minute: "*".to_string(),
            hour: "*".to_string(),
            day_of_week: "*".to_string(),
            day_of_month: "*".to_string(),
            month_of_year: "*".to_string(),
        }
    }
}

impl CrontabSpec {
    /// Fire at `minute` past `hour` every day.
    pub fn at(minute: impl Into<String>, hour: impl Into<String>) -> Self {
        Self {
            minute: minute.into(),
            hour: hour.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_day_of_week(mut self, value: impl Into<String>) -> Self {
        self.day_of_week = value.into();
        self
    }

    #[must_use]
    pub fn with_day_of_month(mut self, value: impl Into<String>) -> Self {
        self.day_of_month = value.into();
        self
    }

    #[must_use]
    pub fn with_month_of_year(mut self, value: impl Into<String>) -> Self {
        self.month_of_year = value.into();
        self
    }

    /// Parse a standard five-field cron line: `minute hour day month weekday`.
    ///
    /// Note the field order differs from the stored column order.
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day_of_month, month_of_year, day_of_week] = parts[..] else {
            return Err(ValidationError::Crontab {
                field: CrontabUnit::Minute,
                value: expr.to_string(),
                reason: format!("expected 5 fields, found {}", parts.len()),
            });
        };

        let spec = Self {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_week: day_of_week.to_string(),
            day_of_month: day_of_month.to_string(),
            month_of_year: month_of_year.to_string(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check every field, reporting the first one that fails.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (unit, expr) in self.fields() {
            CrontabField::parse(unit, expr)?;
        }
        Ok(())
    }

    fn fields(&self) -> [(CrontabUnit, &str); 5] {
        [
            (CrontabUnit::Minute, self.minute.as_str()),
            (CrontabUnit::Hour, self.hour.as_str()),
            (CrontabUnit::DayOfWeek, self.day_of_week.as_str()),
            (CrontabUnit::DayOfMonth, self.day_of_month.as_str()),
            (CrontabUnit::MonthOfYear, self.month_of_year.as_str()),
        ]
    }
}

impl fmt::Display for CrontabSpec {
    /// Renders in standard cron order, the inverse of [`CrontabSpec::parse`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }
}

/// The set of values a single field allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrontabField {
    unit: CrontabUnit,
    values: BTreeSet<u32>,
}

impl CrontabField {
    pub fn parse(unit: CrontabUnit, expr: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::Crontab {
            field: unit,
            value: expr.to_string(),
            reason,
        };

        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid("expression is empty".to_string()));
        }

        let mut values = BTreeSet::new();
        for part in trimmed.split(',') {
            values.extend(Self::parse_part(unit, part.trim()).map_err(invalid)?);
        }

        Ok(Self { unit, values })
    }

    fn parse_part(unit: CrontabUnit, part: &str) -> Result<Vec<u32>, String> {
        let (min, max) = unit.bounds();
        if part.is_empty() {
            return Err("empty list element".to_string());
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|err| format!("invalid step `{step}`: {err}"))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let span: Vec<u32> = if base == "*" {
            (min..=max).collect()
        } else if let Some((start, end)) = base.split_once('-') {
            let start = Self::parse_value(unit, start)?;
            let end = Self::parse_value(unit, end)?;
            if start <= end {
                (start..=end).collect()
            } else {
                (start..=max).chain(min..=end).collect()
            }
        } else if step.is_some() {
            return Err(format!("step needs `*` or a range, got `{base}`"));
        } else {
            vec![Self::parse_value(unit, base)?]
        };

        Ok(match step {
            Some(step) => span.into_iter().step_by(step as usize).collect(),
            None => span,
        })
    }

    fn parse_value(unit: CrontabUnit, token: &str) -> Result<u32, String> {
        let (min, max) = unit.bounds();
        let token = token.trim();
        let value = match token.parse::<u32>() {
            Ok(value) => value,
            Err(_) => unit
                .named_value(token)
                .ok_or_else(|| format!("`{token}` is not a valid {unit}"))?,
        };
        if value < min || value > max {
            return Err(format!("value {value} out of range {min}-{max}"));
        }
        Ok(value)
    }

    pub fn unit(&self) -> CrontabUnit {
        self.unit
    }

    pub fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Allowed values in ascending order.
    pub fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }
}

/// A parsed crontab evaluated in a fixed timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct TzCrontab {
    minute: CrontabField,
    hour: CrontabField,
    day_of_week: CrontabField,
    day_of_month: CrontabField,
    month_of_year: CrontabField,
    tz: Tz,
}

impl TzCrontab {
    pub fn new(spec: &CrontabSpec, tz: Tz) -> Result<Self, ValidationError> {
        Ok(Self {
            minute: CrontabField::parse(CrontabUnit::Minute, &spec.minute)?,
            hour: CrontabField::parse(CrontabUnit::Hour, &spec.hour)?,
            day_of_week: CrontabField::parse(CrontabUnit::DayOfWeek, &spec.day_of_week)?,
            day_of_month: CrontabField::parse(CrontabUnit::DayOfMonth, &spec.day_of_month)?,
            month_of_year: CrontabField::parse(CrontabUnit::MonthOfYear, &spec.month_of_year)?,
            tz,
        })
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn field(&self, unit: CrontabUnit) -> &CrontabField {
        match unit {
            CrontabUnit::Minute => &self.minute,
            CrontabUnit::Hour => &self.hour,
            CrontabUnit::DayOfWeek => &self.day_of_week,
            CrontabUnit::DayOfMonth => &self.day_of_month,
            CrontabUnit::MonthOfYear => &self.month_of_year,
        }
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.day_of_month.contains(date.day())
            && self.day_of_week.contains(date.weekday().num_days_from_sunday())
    }

    /// First matching instant strictly after `after`.
    ///
    /// Matching runs on local wall-clock minutes. Local times that do not
    /// exist (DST gaps) are skipped; ambiguous ones resolve to the earlier
    /// instant. Returns `None` when nothing matches within the search window.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz).naive_local();
        let start: NaiveDateTime = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        let (mut year, mut month) = (start.year(), start.month());
        for _ in 0..MAX_MONTHS_AHEAD {
            if self.month_of_year.contains(month) {
                let first_day = if (year, month) == (start.year(), start.month()) {
                    start.day()
                } else {
                    1
                };
                for day in first_day..=31 {
                    let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                        break;
                    };
                    if !self.date_matches(date) {
                        continue;
                    }
                    if let Some(found) = self.first_time_on(date, start, after) {
                        return Some(found);
                    }
                }
            }
            (year, month) = if month == 12 {
                (year + 1, 1)
            } else {
                (year, month + 1)
            };
        }
        None
    }

    fn first_time_on(
        &self,
        date: NaiveDate,
        start: NaiveDateTime,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        for hour in self.hour.values() {
            for minute in self.minute.values() {
                let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                    continue;
                };
                if naive < start {
                    continue;
                }
                let Some(candidate) = self.tz.from_local_datetime(&naive).earliest() else {
                    continue;
                };
                let candidate = candidate.with_timezone(&Utc);
                if candidate > after {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Seconds from `now` until the first fire after `last_run_at`, clamped
    /// at zero. `None` when the crontab never fires.
    pub fn remaining_estimate(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<f64> {
        self.next_fire_after(last_run_at)
            .map(|next| (next - now).to_std().map_or(0.0, |d| d.as_secs_f64()))
    }

    /// Due check in the style of a beat schedule.
    ///
    /// When due, the time to the following run is re-estimated from a fresh
    /// clock reading.
    pub fn is_due(&self, last_run_at: DateTime<Utc>, clock: &dyn Clock) -> ScheduleState {
        let Some(remaining) = self.remaining_estimate(last_run_at, clock.now()) else {
            return ScheduleState::never();
        };
        if remaining > 0.0 {
            return ScheduleState::not_due(remaining);
        }

        let now = clock.now();
        let next = self
            .remaining_estimate(now, now)
            .unwrap_or(ScheduleState::NEVER);
        ScheduleState::due(next)
    }
}
