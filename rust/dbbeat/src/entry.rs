//! Schedule entries: in-memory snapshots of persisted schedule rows.
//!
//! An entry is immutable. [`ScheduleEntry::is_due`] and
//! [`ScheduleEntry::advance`] return new values which the scheduler swaps
//! into its map; [`ScheduleEntry::persist`] writes the run bookkeeping back
//! and returns the entry rebuilt from the written row.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::StoreError;
use crate::schedule::{Schedule, ScheduleSpec, ScheduleState};
use crate::seeds::BeatDefinition;
use crate::sink::{RoutingOptions, TaskMessage};
use crate::store::{ExtraFields, RunStateUpdate, ScheduleStore};

/// Seconds until a disabled entry is looked at again.
pub const DISABLED_RECHECK_SECS: f64 = 5.0;

/// Clock and timezone shared by every entry of a scheduler.
#[derive(Debug, Clone)]
pub struct EntryContext {
    clock: SharedClock,
    tz: Tz,
}

impl EntryContext {
    pub fn new(clock: SharedClock, tz: Tz) -> Self {
        Self { clock, tz }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Outcome of [`ScheduleEntry::is_due`].
#[derive(Debug, Clone)]
pub struct DueCheck {
    pub state: ScheduleState,
    /// Disabled replacement for a spent one-off entry. The caller persists it
    /// with `enabled` and `total_run_count` written absolutely.
    pub retired: Option<ScheduleEntry>,
}

impl From<ScheduleState> for DueCheck {
    fn from(state: ScheduleState) -> Self {
        Self {
            state,
            retired: None,
        }
    }
}

/// A schedule row plus everything needed to evaluate and fire it.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    spec: ScheduleSpec,
    schedule: Option<Schedule>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    options: RoutingOptions,
    last_run_at: DateTime<Utc>,
    pending_runs: i64,
    defect: Option<String>,
    ctx: EntryContext,
}

impl ScheduleEntry {
    /// Build an entry from a stored row. Never fails: a row that cannot be
    /// evaluated or whose payload cannot be decoded becomes a never-due entry
    /// carrying a defect description.
    pub fn from_spec(spec: ScheduleSpec, ctx: EntryContext) -> Self {
        let mut defects = Vec::new();

        let schedule = match spec.schedule(ctx.tz) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                defects.push(e.to_string());
                None
            }
        };
        let args = decode_args(spec.args.as_deref()).unwrap_or_else(|e| {
            defects.push(e);
            Vec::new()
        });
        let kwargs = decode_kwargs(spec.kwargs.as_deref()).unwrap_or_else(|e| {
            defects.push(e);
            Map::new()
        });

        let last_run_at = spec
            .last_run_time
            .or_else(|| {
                spec.start_time
                    .map(|start| start.checked_sub_signed(Duration::days(365)).unwrap_or(start))
            })
            .unwrap_or_else(|| ctx.now());

        Self {
            options: routing_options(&spec),
            defect: (!defects.is_empty()).then(|| defects.join("; ")),
            spec,
            schedule,
            args,
            kwargs,
            last_run_at,
            pending_runs: 0,
            ctx,
        }
    }

    /// Seed the row named `name` from a static definition and build its entry.
    ///
    /// Inserts the row when absent, otherwise refreshes its schedule-relevant
    /// fields. Counters, `enabled` and `remark` are untouched, and an
    /// unchanged definition writes nothing.
    pub async fn from_entry(
        store: &dyn ScheduleStore,
        ctx: EntryContext,
        name: &str,
        definition: &BeatDefinition,
    ) -> Result<Self, StoreError> {
        let now = ctx.now();
        let outcome = store
            .upsert_definition(&definition.to_params(name, now), now)
            .await?;
        debug!(schedule = %name, action = outcome.action(), "Seeded schedule definition");
        Ok(Self::from_spec(outcome.into_spec(), ctx))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn task(&self) -> &str {
        &self.spec.task
    }

    pub fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn options(&self) -> &RoutingOptions {
        &self.options
    }

    pub fn last_run_at(&self) -> DateTime<Utc> {
        self.last_run_at
    }

    /// Runs recorded in memory but not yet written back.
    pub fn pending_runs(&self) -> i64 {
        self.pending_runs
    }

    /// Why the row cannot be scheduled, if it cannot.
    pub fn defect(&self) -> Option<&str> {
        self.defect.as_deref()
    }

    pub fn is_due(&self) -> DueCheck {
        if !self.spec.enabled {
            return ScheduleState::not_due(DISABLED_RECHECK_SECS).into();
        }

        let now = self.ctx.now();
        if let Some(wait) = self
            .spec
            .start_time
            .and_then(|start| (start - now).to_std().ok())
            .filter(|wait| !wait.is_zero())
        {
            return ScheduleState::not_due(wait.as_secs_f64().ceil()).into();
        }

        if self.spec.one_off && self.spec.total_run_count > 0 {
            return DueCheck {
                state: ScheduleState::never(),
                retired: Some(self.retired()),
            };
        }

        match (&self.schedule, &self.defect) {
            (Some(schedule), None) => schedule
                .is_due(self.last_run_at, self.ctx.clock.as_ref())
                .into(),
            _ => ScheduleState::never().into(),
        }
    }

    fn retired(&self) -> Self {
        let mut retired = self.clone();
        retired.spec.enabled = false;
        // NOTE: zeroing the counter throws away the run history of the spent
        // task. Kept for compatibility with existing deployments; probably
        // unintended.
        retired.spec.total_run_count = 0;
        retired
    }

    /// The entry after one more run at the current time.
    #[must_use]
    pub fn advance(&self) -> Self {
        let now = self.ctx.now();
        let mut next = self.clone();
        next.spec.last_run_time = Some(now);
        next.spec.total_run_count += 1;
        next.last_run_at = now;
        next.pending_runs += 1;
        next
    }

    /// Write run bookkeeping back to the store.
    ///
    /// Pending runs are added to the stored counter under the store's row
    /// lock. Returns the entry rebuilt from the written row, or `None` when
    /// the row is gone.
    pub async fn persist(
        &self,
        store: &dyn ScheduleStore,
        extra: ExtraFields,
    ) -> Result<Option<Self>, StoreError> {
        let update = RunStateUpdate {
            last_run_time: self.spec.last_run_time,
            pending_runs: self.pending_runs,
            extra,
        };

        match store.record_run(self.name(), &update, self.ctx.now()).await? {
            Some(spec) => {
                debug!(
                    schedule = %spec.name,
                    total_run_count = spec.total_run_count,
                    "Schedule state saved"
                );
                Ok(Some(Self::from_spec(spec, self.ctx.clone())))
            }
            None => {
                warn!(schedule = %self.name(), "Schedule no longer exists, state not saved");
                Ok(None)
            }
        }
    }

    /// Message sent to the task sink when this entry fires.
    pub fn message(&self) -> TaskMessage {
        TaskMessage::new(
            self.spec.task.clone(),
            self.args.clone(),
            self.kwargs.clone(),
            self.options.clone(),
        )
    }
}

pub(crate) fn routing_options(spec: &ScheduleSpec) -> RoutingOptions {
    RoutingOptions {
        queue: spec.queue.clone(),
        exchange: spec.exchange.clone(),
        routing_key: spec.routing_key.clone(),
        expires: spec.expires(),
        periodic_task_name: spec.name.clone(),
    }
}

fn parse_payload(field: &str, raw: Option<&str>) -> Result<Value, String> {
    match raw.map(str::trim).filter(|text| !text.is_empty()) {
        None => Ok(Value::Null),
        Some(text) => {
            serde_json::from_str(text).map_err(|e| format!("{field} is not valid JSON: {e}"))
        }
    }
}

pub(crate) fn decode_args(raw: Option<&str>) -> Result<Vec<Value>, String> {
    match parse_payload("args", raw)? {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        other => Err(format!("args must be a JSON array, got {other}")),
    }
}

pub(crate) fn decode_kwargs(raw: Option<&str>) -> Result<Map<String, Value>, String> {
    match parse_payload("kwargs", raw)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => Err(format!("kwargs must be a JSON object, got {other}")),
    }
}
