//! Schedule storage.
//!
//! [`ScheduleStore`] is the persistence seam used by entries, the scheduler
//! and the admin path. Two implementations ship with the crate:
//!
//! - [`SqliteScheduleStore`]: the `task_scheduler` table in an SQLite file
//! - [`InMemoryScheduleStore`]: process-local, for tests and dry runs

pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub use sqlite::SqliteScheduleStore;

use crate::error::StoreError;
use crate::schedule::{ScheduleKind, ScheduleParams, ScheduleSpec};

/// Fields written absolutely alongside a run-state update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraFields {
    pub enabled: Option<bool>,
    /// Replaces the stored counter instead of adding pending runs to it.
    pub total_run_count: Option<i64>,
}

/// Run bookkeeping written back by an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStateUpdate {
    pub last_run_time: Option<DateTime<Utc>>,
    /// Runs observed in memory since the entry was loaded.
    pub pending_runs: i64,
    pub extra: ExtraFields,
}

impl RunStateUpdate {
    /// Apply the update to a freshly read row.
    ///
    /// Pending runs are added to the stored counter so that two writers
    /// holding the same snapshot both land their increments.
    pub fn apply_to(&self, spec: &mut ScheduleSpec, now: DateTime<Utc>) {
        spec.last_run_time = spec.last_run_time.max(self.last_run_time);
        spec.total_run_count = match self.extra.total_run_count {
            Some(count) => count,
            None => spec.total_run_count + self.pending_runs,
        };
        if let Some(enabled) = self.extra.enabled {
            spec.enabled = enabled;
        }
        spec.updated_time = Some(now);
    }
}

/// Listing filter for the admin path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    /// Case-sensitive substring of the schedule name.
    pub name: Option<String>,
    pub kind: Option<ScheduleKind>,
}

impl ScheduleFilter {
    pub fn matches(&self, spec: &ScheduleSpec) -> bool {
        self.name
            .as_deref()
            .is_none_or(|needle| spec.name.contains(needle))
            && self.kind.is_none_or(|kind| spec.kind == kind)
    }
}

/// What an upsert by name did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted(ScheduleSpec),
    Updated(ScheduleSpec),
    Unchanged(ScheduleSpec),
}

impl UpsertOutcome {
    pub fn spec(&self) -> &ScheduleSpec {
        match self {
            Self::Inserted(spec) | Self::Updated(spec) | Self::Unchanged(spec) => spec,
        }
    }

    pub fn into_spec(self) -> ScheduleSpec {
        match self {
            Self::Inserted(spec) | Self::Updated(spec) | Self::Unchanged(spec) => spec,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Inserted(_) => "inserted",
            Self::Updated(_) => "updated",
            Self::Unchanged(_) => "unchanged",
        }
    }
}

/// Persistent store of schedule rows.
///
/// Writes that take `params` validate them first and fail with
/// [`StoreError::Validation`]. `now` stamps `created_time`/`updated_time`.
#[async_trait]
pub trait ScheduleStore: Send + Sync + std::fmt::Debug {
    /// Every row with `enabled = true`, ordered by id.
    async fn load_enabled(&self) -> Result<Vec<ScheduleSpec>, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<ScheduleSpec>, StoreError>;

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleSpec>, StoreError>;

    async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleSpec>, StoreError>;

    /// Insert a new row. Fails with [`StoreError::Conflict`] on a taken name.
    async fn insert(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSpec, StoreError>;

    /// Overwrite every writable field of row `id`. `None` when it does not exist.
    async fn update(
        &self,
        id: i64,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError>;

    /// Insert the row named `params.name`, or overwrite its schedule-relevant
    /// fields. Nothing is written when those fields already match.
    async fn upsert_definition(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Returns `false` when the row does not exist.
    async fn set_enabled(
        &self,
        id: i64,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Apply `update` to the row named `name` under a row lock and return the
    /// written row, or `None` when it no longer exists.
    async fn record_run(
        &self,
        name: &str,
        update: &RunStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError>;

    /// Returns `false` when the row does not exist.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Rows {
    by_id: BTreeMap<i64, ScheduleSpec>,
    next_id: i64,
}

impl Rows {
    fn find_by_name(&self, name: &str) -> Option<&ScheduleSpec> {
        self.by_id.values().find(|spec| spec.name == name)
    }

    fn find_by_name_mut(&mut self, name: &str) -> Option<&mut ScheduleSpec> {
        self.by_id.values_mut().find(|spec| spec.name == name)
    }

    fn insert(&mut self, params: &ScheduleParams, now: DateTime<Utc>) -> ScheduleSpec {
        self.next_id += 1;
        let spec = ScheduleSpec::from_params(self.next_id, params, now);
        self.by_id.insert(spec.id, spec.clone());
        spec
    }
}

/// In-memory schedule store.
///
/// A single mutex guards all rows, so every operation is atomic. Can be
/// switched offline to exercise outage handling.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    rows: Mutex<Rows>,
    offline: AtomicBool,
    rejecting_runs: AtomicBool,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// While set only [`ScheduleStore::record_run`] fails.
    pub fn set_rejecting_runs(&self, rejecting: bool) {
        self.rejecting_runs.store(rejecting, Ordering::SeqCst);
    }

    /// Overwrite a stored row verbatim, bypassing validation.
    pub fn put_raw(&self, spec: ScheduleSpec) {
        let mut rows = self.rows.lock();
        rows.next_id = rows.next_id.max(spec.id);
        rows.by_id.insert(spec.id, spec);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn load_enabled(&self) -> Result<Vec<ScheduleSpec>, StoreError> {
        self.check_online()?;
        Ok(self
            .rows
            .lock()
            .by_id
            .values()
            .filter(|spec| spec.enabled)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<ScheduleSpec>, StoreError> {
        self.check_online()?;
        Ok(self.rows.lock().by_id.get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleSpec>, StoreError> {
        self.check_online()?;
        Ok(self.rows.lock().find_by_name(name).cloned())
    }

    async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleSpec>, StoreError> {
        self.check_online()?;
        Ok(self
            .rows
            .lock()
            .by_id
            .values()
            .filter(|spec| filter.matches(spec))
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSpec, StoreError> {
        self.check_online()?;
        params.validate()?;
        let mut rows = self.rows.lock();
        if rows.find_by_name(&params.name).is_some() {
            return Err(StoreError::Conflict(params.name.clone()));
        }
        Ok(rows.insert(params, now))
    }

    async fn update(
        &self,
        id: i64,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError> {
        self.check_online()?;
        params.validate()?;
        let mut rows = self.rows.lock();
        if rows
            .find_by_name(&params.name)
            .is_some_and(|other| other.id != id)
        {
            return Err(StoreError::Conflict(params.name.clone()));
        }
        let Some(spec) = rows.by_id.get_mut(&id) else {
            return Ok(None);
        };
        spec.apply_params(params);
        spec.updated_time = Some(now);
        Ok(Some(spec.clone()))
    }

    async fn upsert_definition(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_online()?;
        params.validate()?;
        let mut rows = self.rows.lock();
        let Some(existing) = rows.find_by_name_mut(&params.name) else {
            return Ok(UpsertOutcome::Inserted(rows.insert(params, now)));
        };

        let mut candidate = existing.clone();
        candidate.apply_definition(params);
        if candidate == *existing {
            return Ok(UpsertOutcome::Unchanged(candidate));
        }
        candidate.updated_time = Some(now);
        *existing = candidate.clone();
        Ok(UpsertOutcome::Updated(candidate))
    }

    async fn set_enabled(
        &self,
        id: i64,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut rows = self.rows.lock();
        let Some(spec) = rows.by_id.get_mut(&id) else {
            return Ok(false);
        };
        spec.enabled = enabled;
        spec.updated_time = Some(now);
        Ok(true)
    }

    async fn record_run(
        &self,
        name: &str,
        update: &RunStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError> {
        self.check_online()?;
        if self.rejecting_runs.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("run writes are rejected".to_string()));
        }
        let mut rows = self.rows.lock();
        let Some(spec) = rows.find_by_name_mut(name) else {
            return Ok(None);
        };
        update.apply_to(spec, now);
        Ok(Some(spec.clone()))
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.check_online()?;
        Ok(self.rows.lock().by_id.remove(&id).is_some())
    }
}
