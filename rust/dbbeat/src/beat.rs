//! The beat loop.
//!
//! [`BeatService`] keeps a min-heap of `(when, priority, name)` events over
//! the scheduler's entries. Each [`BeatService::tick`] refreshes the
//! schedule, checks the soonest event, fires it through the task sink when
//! due, and returns how long to sleep before the next tick.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::entry::ScheduleEntry;
use crate::error::StoreError;
use crate::scheduler::{DatabaseScheduler, SyncOutcome};
use crate::seeds::BeatTable;
use crate::sink::TaskSink;

/// Upper bound on a single sleep.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);

/// How often dirty entries are written back.
pub const DEFAULT_SYNC_EVERY: Duration = Duration::from_secs(180);

/// Heap priority given to every event.
const DEFAULT_PRIORITY: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEvent {
    when: DateTime<Utc>,
    priority: u8,
    name: String,
}

/// Drives a [`DatabaseScheduler`] and fires due entries into a sink.
#[derive(Debug)]
pub struct BeatService {
    scheduler: DatabaseScheduler,
    sink: Arc<dyn TaskSink>,
    heap: Option<BinaryHeap<Reverse<HeapEvent>>>,
    /// Entry names the heap was built from.
    heap_names: BTreeSet<String>,
    max_interval: Duration,
    sync_every: Duration,
    last_sync: Option<DateTime<Utc>>,
}

impl BeatService {
    pub fn new(scheduler: DatabaseScheduler, sink: Arc<dyn TaskSink>) -> Self {
        Self {
            scheduler,
            sink,
            heap: None,
            heap_names: BTreeSet::new(),
            max_interval: DEFAULT_MAX_INTERVAL,
            sync_every: DEFAULT_SYNC_EVERY,
            last_sync: None,
        }
    }

    #[must_use]
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    #[must_use]
    pub fn with_sync_every(mut self, sync_every: Duration) -> Self {
        self.sync_every = sync_every;
        self
    }

    pub fn scheduler(&self) -> &DatabaseScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut DatabaseScheduler {
        &mut self.scheduler
    }

    fn now(&self) -> DateTime<Utc> {
        self.scheduler.context().now()
    }

    /// Seed the schedule and start the sync timer.
    pub async fn setup(&mut self, seed: &BeatTable) -> Result<(), StoreError> {
        self.scheduler.setup_schedule(seed).await?;
        self.last_sync = Some(self.now());
        Ok(())
    }

    /// Run one scheduling step and return how long to sleep.
    pub async fn tick(&mut self) -> Duration {
        let names: BTreeSet<String> = self.scheduler.schedule().await.keys().cloned().collect();
        let invalidated = self.scheduler.take_heap_invalidated();
        if self.heap.is_none() || invalidated || names != self.heap_names {
            self.populate_heap(names).await;
        }

        let Some(Reverse(event)) = self.heap.as_ref().and_then(|heap| heap.peek()).cloned()
        else {
            return self.max_interval;
        };

        let Some(state) = self.scheduler.is_due(&event.name).await else {
            // Entry vanished since the heap was built.
            self.pop_event();
            return Duration::ZERO;
        };

        self.pop_event();
        if self.scheduler.entry(&event.name).is_none() {
            // Retired by the check above.
            return Duration::ZERO;
        }

        if !state.is_due {
            self.push_event(HeapEvent {
                when: deadline(self.now(), state.next),
                priority: event.priority,
                name: event.name,
            });
            return state.next_delay().min(self.max_interval);
        }

        if let Some(fired) = self.scheduler.entry(&event.name).cloned() {
            self.scheduler.reserve(&event.name);
            self.apply_entry(&fired).await;
        }
        let when = deadline(self.now(), state.next);
        self.push_event(HeapEvent {
            when,
            priority: event.priority,
            name: event.name,
        });
        self.maybe_sync().await;
        Duration::ZERO
    }

    async fn populate_heap(&mut self, names: BTreeSet<String>) {
        let now = self.now();
        let mut heap = BinaryHeap::with_capacity(names.len());
        for name in &names {
            let Some(state) = self.scheduler.is_due(name).await else {
                continue;
            };
            let delay = if state.is_due { 0.0 } else { state.next };
            heap.push(Reverse(HeapEvent {
                when: deadline(now, delay),
                priority: DEFAULT_PRIORITY,
                name: name.clone(),
            }));
        }
        debug!(events = heap.len(), "Populated schedule heap");
        self.heap = Some(heap);
        self.heap_names = names;
    }

    fn pop_event(&mut self) {
        if let Some(heap) = self.heap.as_mut() {
            heap.pop();
        }
    }

    fn push_event(&mut self, event: HeapEvent) {
        if let Some(heap) = self.heap.as_mut() {
            heap.push(Reverse(event));
        }
    }

    async fn apply_entry(&self, entry: &ScheduleEntry) {
        info!(
            schedule = %entry.name(),
            task = %entry.task(),
            "Scheduler: Sending due task"
        );
        if let Err(e) = self.sink.send(entry.message()).await {
            error!(schedule = %entry.name(), error = %e, "Message error");
        }
    }

    async fn maybe_sync(&mut self) {
        let now = self.now();
        let elapsed = self
            .last_sync
            .and_then(|last| (now - last).to_std().ok())
            .unwrap_or(Duration::MAX);
        if elapsed >= self.sync_every {
            self.scheduler.sync().await;
            self.last_sync = Some(now);
        }
    }

    /// Write back every dirty entry.
    pub async fn close(&mut self) -> SyncOutcome {
        let outcome = self.scheduler.sync().await;
        info!(
            saved = outcome.saved,
            retained = outcome.retained,
            "Beat stopped, schedule state synced"
        );
        outcome
    }

    /// Set up, then tick until `shutdown` resolves; syncs on the way out.
    pub async fn run<F>(mut self, seed: &BeatTable, shutdown: F) -> Result<(), StoreError>
    where
        F: Future<Output = ()>,
    {
        self.setup(seed).await?;
        info!(
            max_interval_ms = u64::try_from(self.max_interval.as_millis()).unwrap_or(u64::MAX),
            sync_every_s = self.sync_every.as_secs(),
            "Beat started"
        );

        tokio::pin!(shutdown);
        loop {
            let sleep_for = self.tick().await;
            if !sleep_for.is_zero() {
                debug!(sleep_ms = sleep_for.as_millis(), "beat: Waking up");
            }
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(sleep_for) => {}
            }
        }

        self.close().await;
        Ok(())
    }
}

/// `now + seconds`, saturating at the latest representable instant.
fn deadline(now: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let delay = std::time::Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or_default();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    use crate::clock::{Clock, ManualClock};
    use crate::entry::EntryContext;
    use crate::gate::{ChangeGate, InMemoryChangeStamp};
    use crate::schedule::{IntervalPeriod, ScheduleParams};
    use crate::sink::MemoryTaskSink;
    use crate::store::{InMemoryScheduleStore, ScheduleStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn service() -> (
        Arc<ManualClock>,
        Arc<InMemoryScheduleStore>,
        Arc<MemoryTaskSink>,
        BeatService,
    ) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryScheduleStore::new());
        let gate = ChangeGate::new(Arc::new(InMemoryChangeStamp::new()), clock.clone(), Tz::UTC);
        let ctx = EntryContext::new(clock.clone(), Tz::UTC);
        let scheduler = DatabaseScheduler::new(store.clone(), gate, ctx);
        let sink = Arc::new(MemoryTaskSink::new());
        let beat = BeatService::new(scheduler, sink.clone());
        (clock, store, sink, beat)
    }

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(deadline(t0(), 1.5), t0() + chrono::Duration::milliseconds(1_500));
        assert_eq!(deadline(t0(), -4.0), t0());
        assert_eq!(deadline(DateTime::<Utc>::MAX_UTC, 10.0), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_empty_schedule_sleeps_max_interval() {
        let (_clock, _store, sink, mut beat) = service();
        beat.setup(&BeatTable::new()).await.unwrap();
        assert_eq!(beat.tick().await, DEFAULT_MAX_INTERVAL);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_tick_fires_due_entry_once() {
        let (clock, store, sink, mut beat) = service();
        store
            .insert(
                &ScheduleParams::interval("poll", "app.poll", 10, IntervalPeriod::Seconds),
                t0(),
            )
            .await
            .unwrap();
        beat.setup(&BeatTable::new()).await.unwrap();

        // last_run_at is the load time, so nothing is due yet.
        assert_eq!(beat.tick().await, Duration::from_secs(5));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(beat.tick().await, Duration::ZERO);
        assert_eq!(sink.task_names(), vec!["app.poll"]);
        assert!(beat.scheduler().is_dirty("poll"));

        // Just fired: next run is a full period away, capped at max_interval.
        assert_eq!(beat.tick().await, Duration::from_secs(5));
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_every_writes_back() {
        let (clock, store, _sink, beat) = service();
        let mut beat = beat.with_sync_every(Duration::from_secs(60));
        store
            .insert(
                &ScheduleParams::interval("poll", "app.poll", 30, IntervalPeriod::Seconds),
                t0(),
            )
            .await
            .unwrap();
        beat.setup(&BeatTable::new()).await.unwrap();
        beat.tick().await;

        clock.advance(chrono::Duration::seconds(30));
        beat.tick().await;
        assert_eq!(store.get_by_name("poll").await.unwrap().unwrap().total_run_count, 0);

        clock.advance(chrono::Duration::seconds(30));
        beat.tick().await;
        assert_eq!(store.get_by_name("poll").await.unwrap().unwrap().total_run_count, 2);
        assert_eq!(beat.scheduler().dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_close_flushes_dirty_entries() {
        let (clock, store, _sink, mut beat) = service();
        store
            .insert(
                &ScheduleParams::interval("poll", "app.poll", 30, IntervalPeriod::Seconds),
                t0(),
            )
            .await
            .unwrap();
        beat.setup(&BeatTable::new()).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        beat.tick().await;

        let outcome = beat.close().await;
        assert_eq!(outcome.saved, 1);
        assert_eq!(store.get_by_name("poll").await.unwrap().unwrap().total_run_count, 1);
    }

    #[tokio::test]
    async fn test_spent_one_off_does_not_stall_other_entries() {
        let (clock, store, sink, mut beat) = service();
        let mut once = ScheduleParams::interval("once", "app.once", 10, IntervalPeriod::Seconds);
        once.one_off = true;
        store.insert(&once, t0()).await.unwrap();
        store
            .insert(
                &ScheduleParams::interval("poll", "app.poll", 15, IntervalPeriod::Seconds),
                t0(),
            )
            .await
            .unwrap();
        beat.setup(&BeatTable::new()).await.unwrap();

        let end = t0() + chrono::Duration::seconds(300);
        let mut steps = 0;
        while clock.now() < end {
            let sleep_for = beat.tick().await;
            if !sleep_for.is_zero() {
                clock.advance(chrono::Duration::from_std(sleep_for).unwrap());
            }
            steps += 1;
            assert!(steps < 10_000, "beat stopped advancing");
        }

        let names = sink.task_names();
        assert_eq!(names.iter().filter(|name| name.as_str() == "app.once").count(), 1);
        assert!(names.iter().filter(|name| name.as_str() == "app.poll").count() >= 19);
        assert!(beat.scheduler().entry("once").is_none());
        assert!(!store.get_by_name("once").await.unwrap().unwrap().enabled);
    }
}
