//! Admin mutation path for schedule rows.
//!
//! Every write validates its input, goes through the store, and then stamps
//! the change gate so running beat processes reload. `run_now` bypasses the
//! schedule and hands the task straight to the sink.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::entry::{decode_args, decode_kwargs, routing_options};
use crate::error::{StoreError, ValidationError};
use crate::gate::ChangeNotifier;
use crate::schedule::{ScheduleKind, ScheduleParams, ScheduleSpec};
use crate::sink::{TaskMessage, TaskSink};
use crate::store::{ScheduleFilter, ScheduleStore};

/// Failure of an admin operation.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("schedule {0} not found")]
    NotFound(i64),

    #[error("schedule `{0}` already exists")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(StoreError),

    /// The write succeeded but running schedulers were not told.
    #[error("schedule saved but change notification failed: {0}")]
    Notify(String),

    #[error("failed to dispatch task: {0}")]
    Dispatch(String),
}

impl From<StoreError> for AdminError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(name) => Self::Conflict(name),
            StoreError::Validation(e) => Self::Validation(e),
            other => Self::Store(other),
        }
    }
}

pub type AdminResult<T> = Result<T, AdminError>;

/// CRUD plus manual dispatch over the schedule table.
#[derive(Debug, Clone)]
pub struct ScheduleAdmin {
    store: Arc<dyn ScheduleStore>,
    notifier: ChangeNotifier,
    sink: Arc<dyn TaskSink>,
    clock: SharedClock,
}

impl ScheduleAdmin {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        notifier: ChangeNotifier,
        sink: Arc<dyn TaskSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            notifier,
            sink,
            clock,
        }
    }

    pub async fn get(&self, id: i64) -> AdminResult<ScheduleSpec> {
        self.store.get(id).await?.ok_or(AdminError::NotFound(id))
    }

    pub async fn list(&self, filter: &ScheduleFilter) -> AdminResult<Vec<ScheduleSpec>> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn create(&self, params: &ScheduleParams) -> AdminResult<ScheduleSpec> {
        params.validate()?;
        if self.store.get_by_name(&params.name).await?.is_some() {
            return Err(AdminError::Conflict(params.name.clone()));
        }
        let spec = self.store.insert(params, self.clock.now()).await?;
        info!(id = spec.id, schedule = %spec.name, "Schedule created");
        self.notify().await?;
        Ok(spec)
    }

    /// Overwrite every writable field of `id`.
    pub async fn update(&self, id: i64, params: &ScheduleParams) -> AdminResult<ScheduleSpec> {
        params.validate()?;
        let taken = self.store.get_by_name(&params.name).await?;
        if taken.is_some_and(|existing| existing.id != id) {
            return Err(AdminError::Conflict(params.name.clone()));
        }
        let spec = self
            .store
            .update(id, params, self.clock.now())
            .await?
            .ok_or(AdminError::NotFound(id))?;
        info!(id, schedule = %spec.name, "Schedule updated");
        self.notify().await?;
        Ok(spec)
    }

    /// Flip `enabled`. A crontab row is validated before it is re-enabled.
    pub async fn toggle_status(&self, id: i64) -> AdminResult<ScheduleSpec> {
        let spec = self.get(id).await?;
        let enable = !spec.enabled;
        if enable && spec.kind == ScheduleKind::Crontab {
            spec.crontab.validate()?;
        }
        if !self.store.set_enabled(id, enable, self.clock.now()).await? {
            return Err(AdminError::NotFound(id));
        }
        info!(id, schedule = %spec.name, enabled = enable, "Schedule status toggled");
        self.notify().await?;
        self.get(id).await
    }

    pub async fn delete(&self, id: i64) -> AdminResult<()> {
        if !self.store.delete(id).await? {
            return Err(AdminError::NotFound(id));
        }
        info!(id, "Schedule deleted");
        self.notify().await
    }

    /// Send the task of `id` now, outside its schedule. Run bookkeeping is
    /// left untouched.
    pub async fn run_now(&self, id: i64) -> AdminResult<TaskMessage> {
        let spec = self.get(id).await?;
        let args = decode_args(spec.args.as_deref()).map_err(AdminError::Dispatch)?;
        let kwargs = decode_kwargs(spec.kwargs.as_deref()).map_err(AdminError::Dispatch)?;
        let message = TaskMessage::new(spec.task.clone(), args, kwargs, routing_options(&spec));

        self.sink
            .send(message.clone())
            .await
            .map_err(|e| AdminError::Dispatch(e.to_string()))?;
        info!(id, schedule = %spec.name, task_id = %message.id, "Schedule run manually");
        Ok(message)
    }

    async fn notify(&self) -> AdminResult<()> {
        self.notifier.notify_schedule_changed().await.map_err(|e| {
            warn!(error = %e, "Failed to publish schedule change");
            AdminError::Notify(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::gate::{ChangeStampStore, InMemoryChangeStamp};
    use crate::schedule::{CrontabSpec, IntervalPeriod};
    use crate::sink::MemoryTaskSink;
    use crate::store::InMemoryScheduleStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryScheduleStore>,
        stamps: Arc<InMemoryChangeStamp>,
        sink: Arc<MemoryTaskSink>,
        admin: ScheduleAdmin,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryScheduleStore::new());
        let stamps = Arc::new(InMemoryChangeStamp::new());
        let sink = Arc::new(MemoryTaskSink::new());
        let notifier = ChangeNotifier::new(stamps.clone(), clock.clone());
        let admin = ScheduleAdmin::new(store.clone(), notifier, sink.clone(), clock);
        Fixture {
            store,
            stamps,
            sink,
            admin,
        }
    }

    fn demo() -> ScheduleParams {
        ScheduleParams::interval("demo", "app.tasks.task_demo", 30, IntervalPeriod::Seconds)
    }

    #[tokio::test]
    async fn test_create_notifies_and_rejects_duplicates() {
        let f = fixture();
        let spec = f.admin.create(&demo()).await.unwrap();
        assert!(spec.enabled);
        assert!(f.stamps.read().await.unwrap().is_some());

        let err = f.admin.create(&demo()).await.unwrap_err();
        assert!(matches!(err, AdminError::Conflict(name) if name == "demo"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_without_writing() {
        let f = fixture();
        let bad = ScheduleParams::crontab(
            "bad",
            "app.tasks.task_demo",
            CrontabSpec::at("61", "*"),
        );
        let err = f.admin.create(&bad).await.unwrap_err();
        assert!(matches!(err, AdminError::Validation(ValidationError::Crontab { .. })));
        assert!(f.store.get_by_name("bad").await.unwrap().is_none());
        assert!(f.stamps.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_checks_name_against_other_rows() {
        let f = fixture();
        let a = f.admin.create(&demo()).await.unwrap();
        let mut other = demo();
        other.name = "other".to_string();
        let b = f.admin.create(&other).await.unwrap();

        let err = f.admin.update(b.id, &demo()).await.unwrap_err();
        assert!(matches!(err, AdminError::Conflict(_)));

        let mut renamed = demo();
        renamed.interval_every = Some(60);
        let updated = f.admin.update(a.id, &renamed).await.unwrap();
        assert_eq!(updated.interval_every, Some(60));

        let ghost = ScheduleParams {
            name: "ghost".to_string(),
            ..demo()
        };
        let err = f.admin.update(999, &ghost).await.unwrap_err();
        assert!(matches!(err, AdminError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_toggle_status_flips_enabled() {
        let f = fixture();
        let spec = f.admin.create(&demo()).await.unwrap();
        assert!(!f.admin.toggle_status(spec.id).await.unwrap().enabled);
        assert!(f.admin.toggle_status(spec.id).await.unwrap().enabled);
        assert!(matches!(
            f.admin.toggle_status(42).await.unwrap_err(),
            AdminError::NotFound(42)
        ));
    }

    #[tokio::test]
    async fn test_delete_and_missing_rows() {
        let f = fixture();
        let spec = f.admin.create(&demo()).await.unwrap();
        f.admin.delete(spec.id).await.unwrap();
        assert!(matches!(
            f.admin.get(spec.id).await.unwrap_err(),
            AdminError::NotFound(_)
        ));
        assert!(matches!(
            f.admin.delete(spec.id).await.unwrap_err(),
            AdminError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_run_now_dispatches_payload() {
        let f = fixture();
        let params = demo()
            .with_args(json!(["Hello,"]))
            .with_kwargs(json!({"world": "World"}));
        let spec = f.admin.create(&params).await.unwrap();

        let message = f.admin.run_now(spec.id).await.unwrap();
        assert_eq!(message.args, vec![json!("Hello,")]);
        assert_eq!(message.kwargs["world"], "World");
        assert_eq!(message.options.periodic_task_name, "demo");
        assert_eq!(f.sink.task_names(), vec!["app.tasks.task_demo"]);

        let stored = f.admin.get(spec.id).await.unwrap();
        assert_eq!(stored.total_run_count, 0);
    }

    #[tokio::test]
    async fn test_list_filters_by_name_and_kind() {
        let f = fixture();
        f.admin.create(&demo()).await.unwrap();
        f.admin
            .create(&ScheduleParams::crontab(
                "nightly demo",
                "app.tasks.nightly",
                CrontabSpec::at("0", "3"),
            ))
            .await
            .unwrap();

        let all = f
            .admin
            .list(&ScheduleFilter {
                name: Some("demo".to_string()),
                kind: None,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let crontab = f
            .admin
            .list(&ScheduleFilter {
                name: None,
                kind: Some(ScheduleKind::Crontab),
            })
            .await
            .unwrap();
        assert_eq!(crontab.len(), 1);
        assert_eq!(crontab[0].name, "nightly demo");
    }
}
