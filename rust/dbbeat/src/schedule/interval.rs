//! Fixed-period schedules.

use chrono::{DateTime, Duration, Utc};

use super::{IntervalPeriod, ScheduleState};
use crate::error::ValidationError;

/// Runs every `run_every` after the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSchedule {
    run_every: Duration,
}

impl IntervalSchedule {
    pub fn new(every: i64, period: IntervalPeriod) -> Result<Self, ValidationError> {
        let run_every = period
            .duration(every)
            .filter(|d| *d > Duration::zero())
            .ok_or(ValidationError::InvalidInterval { every, period })?;
        Ok(Self { run_every })
    }

    pub fn run_every(&self) -> Duration {
        self.run_every
    }

    /// Seconds from `now` until `last_run_at + run_every`, clamped at zero.
    pub fn remaining(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let due_at = last_run_at
            .checked_add_signed(self.run_every)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (due_at - now).to_std().map_or(0.0, |d| d.as_secs_f64())
    }

    /// Due once a full period has elapsed; a due result reports the full
    /// period as the time to the next check.
    pub fn is_due(&self, last_run_at: DateTime<Utc>, now: DateTime<Utc>) -> ScheduleState {
        let remaining = self.remaining(last_run_at, now);
        if remaining > 0.0 {
            return ScheduleState::not_due(remaining);
        }
        let period = self.run_every.to_std().map_or(0.0, |d| d.as_secs_f64());
        ScheduleState::due(period)
    }
}
