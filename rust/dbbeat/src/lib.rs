//! dbbeat - database-backed periodic task scheduler
//!
//! Periodic task definitions live in a `task_scheduler` table instead of a
//! static file, so they can be created, edited and toggled while the
//! scheduler runs. The crate provides:
//!
//! - **Schedules**: interval and timezone-aware five-field crontab evaluation
//! - **Entries**: immutable snapshots of a row with run bookkeeping
//! - **Scheduler core**: the live entry map, dirty tracking and write-back
//! - **Change gate**: a Redis timestamp that tells beat processes to reload
//! - **Beat service**: the heap-driven tick loop that fires due tasks
//! - **Admin path**: validated CRUD that publishes every change
//!
//! # Architecture
//!
//! - [`schedule`]: schedule kinds, row model, validation
//! - [`store`]: the [`store::ScheduleStore`] trait, SQLite and in-memory stores
//! - [`entry`]: [`entry::ScheduleEntry`]
//! - [`gate`]: change stamp reader and writer
//! - [`scheduler`]: [`scheduler::DatabaseScheduler`]
//! - [`beat`]: [`beat::BeatService`]
//! - [`sink`]: task delivery
//! - [`admin`]: [`admin::ScheduleAdmin`]
//! - [`config`]: configuration loading and validation
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dbbeat::{BeatService, ChangeGate, DatabaseScheduler, EntryContext, SqliteScheduleStore};
//!
//! let store = Arc::new(SqliteScheduleStore::new("dbbeat.db").await?);
//! let gate = ChangeGate::new(stamps, clock.clone(), tz);
//! let scheduler = DatabaseScheduler::new(store, gate, EntryContext::new(clock, tz));
//! BeatService::new(scheduler, sink)
//!     .run(&dbbeat::seeds::default_beat_schedule(), shutdown)
//!     .await?;
//! ```

pub mod admin;
pub mod beat;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod gate;
pub mod logging;
pub mod schedule;
pub mod scheduler;
pub mod seeds;
pub mod sink;
pub mod store;

pub use admin::{AdminError, ScheduleAdmin};
pub use beat::BeatService;
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use entry::{EntryContext, ScheduleEntry};
pub use error::{StoreError, ValidationError};
pub use gate::{ChangeGate, ChangeNotifier, ChangeStampStore};
pub use schedule::{
    CrontabSpec, IntervalPeriod, Schedule, ScheduleKind, ScheduleParams, ScheduleSpec,
    ScheduleState,
};
pub use scheduler::DatabaseScheduler;
pub use sink::{TaskMessage, TaskSink};
pub use store::{InMemoryScheduleStore, ScheduleStore, SqliteScheduleStore};
