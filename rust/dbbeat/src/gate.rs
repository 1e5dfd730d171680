//! Change detection for the persisted schedule set.
//!
//! Writers stamp a shared timestamp whenever they mutate schedule rows; the
//! beat process compares it against the last time it looked and reloads
//! when the stamp is newer. The stamp lives in Redis under
//! `{prefix}:last_update` so every process sharing the database sees it.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::clock::SharedClock;

/// Format written by older deployments, local time in the configured zone.
const LEGACY_STAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Storage for the single change timestamp.
#[async_trait]
pub trait ChangeStampStore: Send + Sync + fmt::Debug {
    async fn read(&self) -> Result<Option<String>>;

    async fn write(&self, value: &str) -> Result<()>;
}

/// Process-local stamp, for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryChangeStamp {
    value: RwLock<Option<String>>,
}

impl InMemoryChangeStamp {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeStampStore for InMemoryChangeStamp {
    async fn read(&self) -> Result<Option<String>> {
        Ok(self.value.read().clone())
    }

    async fn write(&self, value: &str) -> Result<()> {
        *self.value.write() = Some(value.to_string());
        Ok(())
    }
}

/// Stamp stored in Redis.
#[derive(Clone)]
pub struct RedisChangeStamp {
    redis: ConnectionManager,
    key: String,
}

impl fmt::Debug for RedisChangeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisChangeStamp")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RedisChangeStamp {
    pub fn new(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            key: Self::key_for(prefix),
        }
    }

    /// Redis key holding the stamp for `prefix`.
    pub fn key_for(prefix: &str) -> String {
        format!("{prefix}:last_update")
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl ChangeStampStore for RedisChangeStamp {
    async fn read(&self) -> Result<Option<String>> {
        let mut redis = self.redis.clone();
        let value: Option<String> = redis
            .get(&self.key)
            .await
            .with_context(|| format!("Failed to read {}", self.key))?;
        Ok(value)
    }

    async fn write(&self, value: &str) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .set(&self.key, value)
            .await
            .with_context(|| format!("Failed to write {}", self.key))?;
        Ok(())
    }
}

/// Render a stamp: RFC 3339 with microseconds.
pub fn format_stamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stamp in either the current or the legacy format.
pub fn parse_stamp(raw: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, LEGACY_STAMP_FORMAT).ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|instant| instant.with_timezone(&Utc))
}

/// Writer side of the gate: called after every schedule mutation.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    stamps: Arc<dyn ChangeStampStore>,
    clock: SharedClock,
}

impl ChangeNotifier {
    pub fn new(stamps: Arc<dyn ChangeStampStore>, clock: SharedClock) -> Self {
        Self { stamps, clock }
    }

    /// Stamp the current time so beat processes reload.
    pub async fn notify_schedule_changed(&self) -> Result<()> {
        let stamp = format_stamp(self.clock.now());
        self.stamps.write(&stamp).await?;
        debug!(stamp = %stamp, "Schedule change published");
        Ok(())
    }
}

/// Reader side of the gate, owned by the scheduler.
#[derive(Debug)]
pub struct ChangeGate {
    stamps: Arc<dyn ChangeStampStore>,
    clock: SharedClock,
    tz: Tz,
    /// When this gate last looked; `None` until the first successful read.
    last_checked: Option<DateTime<Utc>>,
}

impl ChangeGate {
    pub fn new(stamps: Arc<dyn ChangeStampStore>, clock: SharedClock, tz: Tz) -> Self {
        Self {
            stamps,
            clock,
            tz,
            last_checked: None,
        }
    }

    /// A notifier writing to the same stamp.
    pub fn notifier(&self) -> ChangeNotifier {
        ChangeNotifier::new(Arc::clone(&self.stamps), Arc::clone(&self.clock))
    }

    /// Whether the schedule set changed since the previous call.
    ///
    /// The first call only establishes a baseline and reports no change.
    /// Store errors are logged and reported as no change.
    pub async fn schedule_changed(&mut self) -> bool {
        match self.check().await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "Failed to read schedule change stamp, assuming unchanged");
                false
            }
        }
    }

    async fn check(&mut self) -> Result<bool> {
        let now = self.clock.now();
        let stored = match self.stamps.read().await? {
            Some(raw) => parse_stamp(&raw, self.tz).or_else(|| {
                warn!(stamp = %raw, "Unreadable schedule change stamp, resetting it");
                None
            }),
            None => None,
        };

        let Some(stored) = stored else {
            self.stamps.write(&format_stamp(now)).await?;
            return Ok(false);
        };

        let changed = self.last_checked.is_some_and(|seen| stored > seen);
        self.last_checked = Some(now);
        Ok(changed)
    }
}
