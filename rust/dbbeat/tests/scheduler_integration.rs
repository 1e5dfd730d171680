//! End-to-end scheduler behaviour against the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tempfile::TempDir;

use dbbeat::admin::ScheduleAdmin;
use dbbeat::clock::ManualClock;
use dbbeat::gate::{ChangeGate, InMemoryChangeStamp};
use dbbeat::seeds::{self, BeatTable};
use dbbeat::sink::MemoryTaskSink;
use dbbeat::store::{ExtraFields, InMemoryScheduleStore, ScheduleFilter};
use dbbeat::{
    BeatService, CrontabSpec, DatabaseScheduler, EntryContext, IntervalPeriod, ScheduleEntry,
    ScheduleParams, ScheduleState, ScheduleStore, SqliteScheduleStore,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

async fn sqlite_store() -> (TempDir, Arc<SqliteScheduleStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScheduleStore::new(dir.path().join("beat.db"))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

fn scheduler(
    store: Arc<dyn ScheduleStore>,
    stamps: Arc<InMemoryChangeStamp>,
    clock: Arc<ManualClock>,
    tz: Tz,
) -> DatabaseScheduler {
    let gate = ChangeGate::new(stamps, clock.clone(), tz);
    DatabaseScheduler::new(store, gate, EntryContext::new(clock, tz))
}

#[tokio::test]
async fn test_concurrent_persists_keep_both_increments() {
    let (_dir, store) = sqlite_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let spec = store
        .insert(
            &ScheduleParams::interval("poll", "app.poll", 30, IntervalPeriod::Seconds),
            t0(),
        )
        .await
        .unwrap();

    let snapshot = ScheduleEntry::from_spec(spec, EntryContext::new(clock.clone(), Tz::UTC));
    clock.advance(chrono::Duration::seconds(30));
    let first = snapshot.advance();
    let second = snapshot.advance();

    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|entry| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                entry
                    .persist(store.as_ref(), ExtraFields::default())
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_some());
    }

    let stored = store.get_by_name("poll").await.unwrap().unwrap();
    assert_eq!(stored.total_run_count, 2);
    assert_eq!(stored.last_run_time, Some(t0() + chrono::Duration::seconds(30)));
}

#[tokio::test]
async fn test_sequential_persists_from_one_snapshot() {
    let (_dir, store) = sqlite_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let spec = store
        .insert(
            &ScheduleParams::interval("poll", "app.poll", 30, IntervalPeriod::Seconds),
            t0(),
        )
        .await
        .unwrap();
    let snapshot = ScheduleEntry::from_spec(spec, EntryContext::new(clock.clone(), Tz::UTC));

    clock.advance(chrono::Duration::seconds(30));
    let saved = snapshot
        .advance()
        .persist(store.as_ref(), ExtraFields::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved.spec().total_run_count, 1);
    assert_eq!(
        saved.spec().last_run_time,
        Some(t0() + chrono::Duration::seconds(30))
    );

    snapshot
        .advance()
        .persist(store.as_ref(), ExtraFields::default())
        .await
        .unwrap();
    let stored = store.get_by_name("poll").await.unwrap().unwrap();
    assert_eq!(stored.total_run_count, 2);
}

#[tokio::test]
async fn test_malformed_row_is_disabled_on_load() {
    let (dir, store) = sqlite_store().await;
    store
        .insert(
            &ScheduleParams::interval("good", "app.good", 30, IntervalPeriod::Seconds),
            t0(),
        )
        .await
        .unwrap();

    // Written around the store, as a direct SQL edit would be.
    let conn = rusqlite::Connection::open(dir.path().join("beat.db")).unwrap();
    conn.execute(
        "INSERT INTO task_scheduler (name, task, schedule_kind, crontab_minute, args, \
         created_time) VALUES ('broken', 'app.broken', 1, '70', 'not json', \
         '2024-06-01T00:00:00Z')",
        [],
    )
    .unwrap();
    drop(conn);

    let clock = Arc::new(ManualClock::new(t0()));
    let mut scheduler = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock,
        Tz::UTC,
    );
    assert_eq!(scheduler.schedule().await.len(), 2);

    let broken = scheduler.entry("broken").unwrap();
    let defect = broken.defect().unwrap();
    assert!(defect.contains("crontab"), "{defect}");
    assert!(defect.contains("args"), "{defect}");
    assert_eq!(scheduler.is_due("broken").await, Some(ScheduleState::never()));

    let stored = store.get_by_name("broken").await.unwrap().unwrap();
    assert!(!stored.enabled);
    assert!(store.get_by_name("good").await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_naive_timestamps_load_as_utc() {
    let (dir, store) = sqlite_store().await;
    store
        .insert(
            &ScheduleParams::interval("good", "app.good", 30, IntervalPeriod::Seconds),
            t0(),
        )
        .await
        .unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("beat.db")).unwrap();
    conn.execute(
        "INSERT INTO task_scheduler (name, task, schedule_kind, interval_every, \
         interval_period, start_time, created_time) VALUES ('legacy', 'app.legacy', 0, 30, \
         'seconds', '2024-06-01 10:00:00', '2024-06-01 09:00:00')",
        [],
    )
    .unwrap();
    drop(conn);

    let clock = Arc::new(ManualClock::new(t0()));
    let mut scheduler = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock,
        Tz::UTC,
    );
    assert_eq!(scheduler.schedule().await.len(), 2);

    let legacy = scheduler.entry("legacy").unwrap();
    assert_eq!(
        legacy.spec().start_time,
        Some(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
    );
    assert!(store.get_by_name("legacy").await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_undecodable_row_is_skipped_and_disabled() {
    let (dir, store) = sqlite_store().await;
    store
        .insert(
            &ScheduleParams::interval("good", "app.good", 30, IntervalPeriod::Seconds),
            t0(),
        )
        .await
        .unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("beat.db")).unwrap();
    conn.execute(
        "INSERT INTO task_scheduler (name, task, schedule_kind, interval_every, \
         interval_period, start_time, created_time) VALUES ('garbled', 'app.garbled', 0, 30, \
         'seconds', 'next tuesday', '2024-06-01T00:00:00Z')",
        [],
    )
    .unwrap();
    drop(conn);

    let clock = Arc::new(ManualClock::new(t0()));
    let mut scheduler = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock,
        Tz::UTC,
    );
    let entries = scheduler.schedule().await;
    assert_eq!(entries.len(), 1);
    assert!(entries.contains_key("good"));

    assert_eq!(store.load_enabled().await.unwrap().len(), 1);
    let conn = rusqlite::Connection::open(dir.path().join("beat.db")).unwrap();
    let enabled: bool = conn
        .query_row(
            "SELECT enabled FROM task_scheduler WHERE name = 'garbled'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(!enabled);
}

#[tokio::test]
async fn test_cleanup_crontab_due_at_four() {
    let tz = chrono_tz::Asia::Shanghai;
    let today_four = tz
        .with_ymd_and_hms(2024, 6, 2, 4, 0, 0)
        .unwrap()
        .with_timezone(&Utc);
    let store = Arc::new(InMemoryScheduleStore::new());
    let mut spec = store
        .insert(
            &ScheduleParams::crontab("cleanup", "app.cleanup", CrontabSpec::at("0", "4")),
            today_four,
        )
        .await
        .unwrap();
    spec.last_run_time = Some(today_four - chrono::Duration::days(1));
    store.put_raw(spec);

    let clock = Arc::new(ManualClock::new(today_four));
    let mut scheduler = scheduler(store, Arc::new(InMemoryChangeStamp::new()), clock, tz);
    scheduler.schedule().await;

    let state = scheduler.is_due("cleanup").await.unwrap();
    assert!(state.is_due);
    assert!((state.next - 86_400.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_beat_fires_and_writes_back() {
    let (_dir, store) = sqlite_store().await;
    store
        .insert(
            &ScheduleParams::interval("poll", "app.poll", 10, IntervalPeriod::Seconds)
                .with_args(serde_json::json!([1, 2])),
            t0(),
        )
        .await
        .unwrap();

    let clock = Arc::new(ManualClock::new(t0()));
    let sink = Arc::new(MemoryTaskSink::new());
    let scheduler = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock.clone(),
        Tz::UTC,
    );
    let mut beat = BeatService::new(scheduler, sink.clone()).with_sync_every(Duration::ZERO);
    beat.setup(&BeatTable::new()).await.unwrap();
    assert!(!beat.tick().await.is_zero());

    clock.advance(chrono::Duration::seconds(10));
    assert!(beat.tick().await.is_zero());

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].args, vec![serde_json::json!(1), serde_json::json!(2)]);
    assert_eq!(messages[0].options.periodic_task_name, "poll");

    let stored = store.get_by_name("poll").await.unwrap().unwrap();
    assert_eq!(stored.total_run_count, 1);
    assert_eq!(stored.last_run_time, Some(t0() + chrono::Duration::seconds(10)));
}

#[tokio::test]
async fn test_admin_change_reloads_running_beat() {
    let (_dir, store) = sqlite_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let stamps = Arc::new(InMemoryChangeStamp::new());
    let sink = Arc::new(MemoryTaskSink::new());

    let scheduler = scheduler(store.clone(), stamps.clone(), clock.clone(), Tz::UTC);
    let mut beat = BeatService::new(scheduler, sink.clone());
    beat.setup(&BeatTable::new()).await.unwrap();
    beat.tick().await;
    assert!(beat.scheduler().entries().is_empty());

    let admin = ScheduleAdmin::new(
        store.clone(),
        dbbeat::ChangeNotifier::new(stamps, clock.clone()),
        sink.clone(),
        clock.clone(),
    );
    clock.advance(chrono::Duration::seconds(1));
    let created = admin
        .create(&ScheduleParams::interval(
            "fresh",
            "app.fresh",
            5,
            IntervalPeriod::Seconds,
        ))
        .await
        .unwrap();

    clock.advance(chrono::Duration::seconds(1));
    beat.tick().await;
    assert!(beat.scheduler().entry("fresh").is_some());

    clock.advance(chrono::Duration::seconds(1));
    admin.toggle_status(created.id).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    beat.tick().await;
    assert!(beat.scheduler().entry("fresh").is_none());
}

#[tokio::test]
async fn test_seeding_twice_keeps_one_row_per_name() {
    let (_dir, store) = sqlite_store().await;
    let clock = Arc::new(ManualClock::new(t0()));
    let seed = seeds::default_beat_schedule();

    let mut first = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock.clone(),
        Tz::UTC,
    )
    .with_result_expires(Some(Duration::from_secs(86_400)));
    first.setup_schedule(&seed).await.unwrap();
    let before = store.list(&ScheduleFilter::default()).await.unwrap();
    assert_eq!(before.len(), 3);

    clock.advance(chrono::Duration::hours(1));
    let mut second = scheduler(
        store.clone(),
        Arc::new(InMemoryChangeStamp::new()),
        clock,
        Tz::UTC,
    )
    .with_result_expires(Some(Duration::from_secs(86_400)));
    second.setup_schedule(&seed).await.unwrap();

    let after = store.list(&ScheduleFilter::default()).await.unwrap();
    assert_eq!(before, after);
    assert!(second.entry("Clean login logs").is_some());
    assert!(second.entry(seeds::BACKEND_CLEANUP).is_some());
}
