//! `SQLite` backend for schedule rows.
//!
//! Stores schedules in the `task_scheduler` table with:
//! - Write-Ahead Logging (WAL) so the beat process and admin writers can
//!   work side by side
//! - a busy timeout instead of immediate `SQLITE_BUSY` failures
//! - `BEGIN IMMEDIATE` transactions as the row lock for read-modify-write
//!   updates
//! - a table CHECK keeping `expire_time` and `expire_seconds` exclusive
//!
//! Timestamps are stored as RFC 3339 text in UTC. Rows written by other
//! tools with naive `YYYY-MM-DD HH:MM:SS` timestamps are read as UTC; a row
//! that still cannot be decoded is disabled on load instead of failing it.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbbeat::store::SqliteScheduleStore;
//!
//! let store = SqliteScheduleStore::new("./data/dbbeat.db").await?;
//! let enabled = store.load_enabled().await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, named_params};
use tokio::task;

use super::{RunStateUpdate, ScheduleFilter, ScheduleStore, UpsertOutcome};
use crate::error::StoreError;
use crate::schedule::{CrontabSpec, ScheduleKind, ScheduleParams, ScheduleSpec};

/// Naive timestamp layouts accepted besides RFC 3339.
const NAIVE_TS_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS task_scheduler (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    task TEXT NOT NULL,
    args TEXT,
    kwargs TEXT,
    queue TEXT,
    exchange TEXT,
    routing_key TEXT,
    start_time TEXT,
    expire_time TEXT,
    expire_seconds INTEGER,
    schedule_kind INTEGER NOT NULL CHECK (schedule_kind IN (0, 1)),
    interval_every INTEGER,
    interval_period TEXT,
    crontab_minute TEXT NOT NULL DEFAULT '*',
    crontab_hour TEXT NOT NULL DEFAULT '*',
    crontab_day_of_week TEXT NOT NULL DEFAULT '*',
    crontab_day_of_month TEXT NOT NULL DEFAULT '*',
    crontab_month_of_year TEXT NOT NULL DEFAULT '*',
    one_off INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    total_run_count INTEGER NOT NULL DEFAULT 0 CHECK (total_run_count >= 0),
    last_run_time TEXT,
    remark TEXT,
    created_time TEXT NOT NULL,
    updated_time TEXT,
    CHECK (expire_time IS NULL OR expire_seconds IS NULL)
);

CREATE INDEX IF NOT EXISTS idx_task_scheduler_enabled ON task_scheduler(enabled);
";

const SELECT_SPEC: &str = "SELECT id, name, task, args, kwargs, queue, exchange, routing_key, \
     start_time, expire_time, expire_seconds, schedule_kind, interval_every, interval_period, \
     crontab_minute, crontab_hour, crontab_day_of_week, crontab_day_of_month, \
     crontab_month_of_year, one_off, enabled, total_run_count, last_run_time, remark, \
     created_time, updated_time FROM task_scheduler";

const INSERT_SPEC: &str = "INSERT INTO task_scheduler (id, name, task, args, kwargs, queue, \
     exchange, routing_key, start_time, expire_time, expire_seconds, schedule_kind, \
     interval_every, interval_period, crontab_minute, crontab_hour, crontab_day_of_week, \
     crontab_day_of_month, crontab_month_of_year, one_off, enabled, total_run_count, \
     last_run_time, remark, created_time, updated_time) VALUES (:id, :name, :task, :args, \
     :kwargs, :queue, :exchange, :routing_key, :start_time, :expire_time, :expire_seconds, \
     :schedule_kind, :interval_every, :interval_period, :crontab_minute, :crontab_hour, \
     :crontab_day_of_week, :crontab_day_of_month, :crontab_month_of_year, :one_off, :enabled, \
     :total_run_count, :last_run_time, :remark, :created_time, :updated_time)";

const UPDATE_SPEC: &str = "UPDATE task_scheduler SET name = :name, task = :task, args = :args, \
     kwargs = :kwargs, queue = :queue, exchange = :exchange, routing_key = :routing_key, \
     start_time = :start_time, expire_time = :expire_time, expire_seconds = :expire_seconds, \
     schedule_kind = :schedule_kind, interval_every = :interval_every, \
     interval_period = :interval_period, crontab_minute = :crontab_minute, \
     crontab_hour = :crontab_hour, crontab_day_of_week = :crontab_day_of_week, \
     crontab_day_of_month = :crontab_day_of_month, \
     crontab_month_of_year = :crontab_month_of_year, one_off = :one_off, enabled = :enabled, \
     total_run_count = :total_run_count, last_run_time = :last_run_time, remark = :remark, \
     created_time = :created_time, updated_time = :updated_time WHERE id = :id";

/// SQLite-backed schedule store.
///
/// Each operation opens its own connection on the blocking thread pool, so
/// the store holds no shared connection state and is cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    /// Path to the `SQLite` database file.
    db_path: PathBuf,
}

impl SqliteScheduleStore {
    /// Open (creating if needed) the database at `path` and migrate the schema.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened, WAL mode cannot be enabled,
    /// or the schema cannot be created.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let store = Self {
            db_path: path.into(),
        };
        store.migrate_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn migrate_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.execute_batch(SCHEMA)?;
            tracing::debug!("Schedule table schema ready");
            Ok(())
        })
        .await
    }

    /// Run `op` against a fresh connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&db_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            op(&mut conn)
        })
        .await?
    }
}

fn format_ts(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|err| {
            NAIVE_TS_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| naive.and_utc())
                .ok_or(err)
        })
}

fn read_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        parse_ts(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_spec(row: &Row<'_>) -> rusqlite::Result<ScheduleSpec> {
    let kind_code: i64 = row.get(11)?;
    let kind = ScheduleKind::from_code(kind_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(11, kind_code))?;
    // An unknown period leaves the interval incomplete; the entry reports it.
    let period: Option<String> = row.get(13)?;
    let created_time = read_ts(row, 24)?.ok_or(rusqlite::Error::InvalidColumnType(
        24,
        "created_time".to_string(),
        Type::Null,
    ))?;

    Ok(ScheduleSpec {
        id: row.get(0)?,
        name: row.get(1)?,
        task: row.get(2)?,
        args: row.get(3)?,
        kwargs: row.get(4)?,
        queue: row.get(5)?,
        exchange: row.get(6)?,
        routing_key: row.get(7)?,
        start_time: read_ts(row, 8)?,
        expire_time: read_ts(row, 9)?,
        expire_seconds: row.get(10)?,
        kind,
        interval_every: row.get(12)?,
        interval_period: period.and_then(|p| p.parse().ok()),
        crontab: CrontabSpec {
            minute: row.get(14)?,
            hour: row.get(15)?,
            day_of_week: row.get(16)?,
            day_of_month: row.get(17)?,
            month_of_year: row.get(18)?,
        },
        one_off: row.get(19)?,
        enabled: row.get(20)?,
        total_run_count: row.get(21)?,
        last_run_time: read_ts(row, 22)?,
        remark: row.get(23)?,
        created_time,
        updated_time: read_ts(row, 25)?,
    })
}

/// Execute `sql` with every column of `spec` bound by name.
fn execute_spec(conn: &Connection, sql: &str, spec: &ScheduleSpec) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        named_params! {
            ":id": (spec.id != 0).then_some(spec.id),
            ":name": spec.name,
            ":task": spec.task,
            ":args": spec.args,
            ":kwargs": spec.kwargs,
            ":queue": spec.queue,
            ":exchange": spec.exchange,
            ":routing_key": spec.routing_key,
            ":start_time": spec.start_time.map(format_ts),
            ":expire_time": spec.expire_time.map(format_ts),
            ":expire_seconds": spec.expire_seconds,
            ":schedule_kind": spec.kind.code(),
            ":interval_every": spec.interval_every,
            ":interval_period": spec.interval_period.map(|p| p.as_str()),
            ":crontab_minute": spec.crontab.minute,
            ":crontab_hour": spec.crontab.hour,
            ":crontab_day_of_week": spec.crontab.day_of_week,
            ":crontab_day_of_month": spec.crontab.day_of_month,
            ":crontab_month_of_year": spec.crontab.month_of_year,
            ":one_off": spec.one_off,
            ":enabled": spec.enabled,
            ":total_run_count": spec.total_run_count,
            ":last_run_time": spec.last_run_time.map(format_ts),
            ":remark": spec.remark,
            ":created_time": format_ts(spec.created_time),
            ":updated_time": spec.updated_time.map(format_ts),
        },
    )
}

fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<ScheduleSpec>> {
    conn.query_row(&format!("{SELECT_SPEC} WHERE id = ?1"), [id], row_to_spec)
        .optional()
}

fn find_by_name(conn: &Connection, name: &str) -> rusqlite::Result<Option<ScheduleSpec>> {
    conn.query_row(&format!("{SELECT_SPEC} WHERE name = ?1"), [name], row_to_spec)
        .optional()
}

fn insert_spec(
    conn: &Connection,
    params: &ScheduleParams,
    now: DateTime<Utc>,
) -> Result<ScheduleSpec, StoreError> {
    if find_by_name(conn, &params.name)?.is_some() {
        return Err(StoreError::Conflict(params.name.clone()));
    }
    let mut spec = ScheduleSpec::from_params(0, params, now);
    execute_spec(conn, INSERT_SPEC, &spec)?;
    spec.id = conn.last_insert_rowid();
    Ok(spec)
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn load_enabled(&self) -> Result<Vec<ScheduleSpec>, StoreError> {
        self.with_connection(|conn| {
            let mut specs = Vec::new();
            let mut unreadable = Vec::new();
            {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_SPEC} WHERE enabled = 1 ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    match row_to_spec(row) {
                        Ok(spec) => specs.push(spec),
                        Err(e) => {
                            let id: i64 = row.get(0)?;
                            let name: String = row.get(1)?;
                            tracing::error!(
                                id,
                                schedule = %name,
                                error = %e,
                                "Disabling unreadable schedule row"
                            );
                            unreadable.push(id);
                        }
                    }
                }
            }
            for id in unreadable {
                conn.execute("UPDATE task_scheduler SET enabled = 0 WHERE id = ?1", [id])?;
            }
            Ok(specs)
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<ScheduleSpec>, StoreError> {
        self.with_connection(move |conn| Ok(find_by_id(conn, id)?)).await
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduleSpec>, StoreError> {
        let name = name.to_string();
        self.with_connection(move |conn| Ok(find_by_name(conn, &name)?))
            .await
    }

    async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleSpec>, StoreError> {
        let filter = filter.clone();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SPEC} WHERE (:name IS NULL OR instr(name, :name) > 0) \
                 AND (:kind IS NULL OR schedule_kind = :kind) ORDER BY id"
            ))?;
            let specs = stmt
                .query_map(
                    named_params! {
                        ":name": filter.name,
                        ":kind": filter.kind.map(ScheduleKind::code),
                    },
                    row_to_spec,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(specs)
        })
        .await
    }

    async fn insert(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSpec, StoreError> {
        params.validate()?;
        let params = params.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let spec = insert_spec(&tx, &params, now)?;
            tx.commit()?;
            Ok(spec)
        })
        .await
    }

    async fn update(
        &self,
        id: i64,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError> {
        params.validate()?;
        let params = params.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut spec) = find_by_id(&tx, id)? else {
                return Ok(None);
            };
            if find_by_name(&tx, &params.name)?.is_some_and(|other| other.id != id) {
                return Err(StoreError::Conflict(params.name.clone()));
            }
            spec.apply_params(&params);
            spec.updated_time = Some(now);
            execute_spec(&tx, UPDATE_SPEC, &spec)?;
            tx.commit()?;
            Ok(Some(spec))
        })
        .await
    }

    async fn upsert_definition(
        &self,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        params.validate()?;
        let params = params.clone();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = match find_by_name(&tx, &params.name)? {
                None => UpsertOutcome::Inserted(insert_spec(&tx, &params, now)?),
                Some(existing) => {
                    let mut candidate = existing.clone();
                    candidate.apply_definition(&params);
                    if candidate == existing {
                        UpsertOutcome::Unchanged(existing)
                    } else {
                        candidate.updated_time = Some(now);
                        execute_spec(&tx, UPDATE_SPEC, &candidate)?;
                        UpsertOutcome::Updated(candidate)
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn set_enabled(
        &self,
        id: i64,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_connection(move |conn| {
            let changed = conn.execute(
                "UPDATE task_scheduler SET enabled = ?1, updated_time = ?2 WHERE id = ?3",
                rusqlite::params![enabled, format_ts(now), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn record_run(
        &self,
        name: &str,
        update: &RunStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleSpec>, StoreError> {
        let name = name.to_string();
        let update = update.clone();
        self.with_connection(move |conn| {
            // IMMEDIATE takes the write lock before the read.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut spec) = find_by_name(&tx, &name)? else {
                return Ok(None);
            };
            update.apply_to(&mut spec, now);
            tx.execute(
                "UPDATE task_scheduler SET last_run_time = ?1, total_run_count = ?2, \
                 enabled = ?3, updated_time = ?4 WHERE id = ?5",
                rusqlite::params![
                    spec.last_run_time.map(format_ts),
                    spec.total_run_count,
                    spec.enabled,
                    spec.updated_time.map(format_ts),
                    spec.id,
                ],
            )?;
            tx.commit()?;
            Ok(Some(spec))
        })
        .await
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        self.with_connection(move |conn| {
            let removed = conn.execute("DELETE FROM task_scheduler WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
        .await
    }
}
