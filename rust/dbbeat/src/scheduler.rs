//! Scheduler core: the live map of schedule entries.
//!
//! [`DatabaseScheduler`] owns the `name -> entry` map loaded from the store,
//! the set of names whose run bookkeeping has not been written back, and
//! the change gate that decides when to reload. It is driven by
//! [`crate::beat::BeatService`], which holds it by value; nothing here is
//! shared between tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::entry::{DISABLED_RECHECK_SECS, EntryContext, ScheduleEntry};
use crate::error::StoreError;
use crate::gate::ChangeGate;
use crate::logging::OpTimer;
use crate::schedule::ScheduleState;
use crate::seeds::{self, BeatTable};
use crate::store::{ExtraFields, ScheduleStore};

/// What a call to [`DatabaseScheduler::sync`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Entries written back.
    pub saved: usize,
    /// Dirty names dropped because their entry or row no longer exists.
    pub dropped: usize,
    /// Dirty names kept for the next attempt after a storage error.
    pub retained: usize,
}

/// Database-backed schedule state.
#[derive(Debug)]
pub struct DatabaseScheduler {
    store: Arc<dyn ScheduleStore>,
    gate: ChangeGate,
    ctx: EntryContext,
    entries: HashMap<String, ScheduleEntry>,
    dirty: HashSet<String>,
    /// Set until the first successful load, and again after a failed reload.
    reload_pending: bool,
    loaded_once: bool,
    heap_invalidated: bool,
    result_expires: Option<Duration>,
}

impl DatabaseScheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, gate: ChangeGate, ctx: EntryContext) -> Self {
        Self {
            store,
            gate,
            ctx,
            entries: HashMap::new(),
            dirty: HashSet::new(),
            reload_pending: true,
            loaded_once: false,
            heap_invalidated: false,
            result_expires: None,
        }
    }

    /// Enables the `celery.backend_cleanup` default entry.
    #[must_use]
    pub fn with_result_expires(mut self, result_expires: Option<Duration>) -> Self {
        self.result_expires = result_expires;
        self
    }

    pub fn context(&self) -> &EntryContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Current entries without consulting the gate.
    pub fn entries(&self) -> &HashMap<String, ScheduleEntry> {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ScheduleEntry> {
        self.entries.get(name)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.dirty.contains(name)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Returns and clears the flag raised by a non-initial reload.
    pub fn take_heap_invalidated(&mut self) -> bool {
        std::mem::take(&mut self.heap_invalidated)
    }

    /// Initial read, default entries, then the host's seed table.
    pub async fn setup_schedule(&mut self, seed: &BeatTable) -> Result<(), StoreError> {
        info!(seeds = seed.len(), "Setting up schedule");
        self.schedule().await;
        self.install_default_entries().await?;
        self.update_from_dict(seed).await
    }

    /// The live entry map, reloaded first when needed.
    ///
    /// Reloads on first access, after a failed reload, and whenever the gate
    /// reports a change. Dirty entries are synced before the map is replaced;
    /// while any of them cannot be written the old map is kept and the reload
    /// stays pending.
    pub async fn schedule(&mut self) -> &HashMap<String, ScheduleEntry> {
        let update = if self.reload_pending {
            debug!("DatabaseScheduler: initial read");
            true
        } else if self.gate.schedule_changed().await {
            info!("DatabaseScheduler: Schedule changed.");
            true
        } else {
            false
        };

        if update {
            let outcome = self.sync().await;
            if outcome.retained > 0 {
                warn!(
                    retained = outcome.retained,
                    "Run bookkeeping not written back, deferring schedule reload"
                );
                self.reload_pending = true;
                return &self.entries;
            }
            match self.load_entries().await {
                Ok(entries) => {
                    debug!(count = entries.len(), "Schedule entries loaded");
                    self.entries = entries;
                    self.reload_pending = false;
                    if self.loaded_once {
                        self.heap_invalidated = true;
                    }
                    self.loaded_once = true;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to reload schedule, keeping previous entries");
                    self.reload_pending = true;
                }
            }
        }

        &self.entries
    }

    async fn load_entries(&self) -> Result<HashMap<String, ScheduleEntry>, StoreError> {
        let timer = OpTimer::new("scheduler", "reload");
        let result = self.store.load_enabled().await;
        timer.finish_with_result(result.as_ref());

        let mut entries = HashMap::new();
        for spec in result? {
            let entry = ScheduleEntry::from_spec(spec, self.ctx.clone());
            self.quarantine(&entry).await;
            entries.insert(entry.name().to_string(), entry);
        }
        Ok(entries)
    }

    /// Disable the stored row of an entry that cannot be scheduled.
    async fn quarantine(&self, entry: &ScheduleEntry) {
        let Some(defect) = entry.defect() else {
            return;
        };
        error!(
            schedule = %entry.name(),
            defect = %defect,
            "Disabling schedule with unusable definition"
        );
        if let Err(e) = self
            .store
            .set_enabled(entry.spec().id, false, self.ctx.now())
            .await
        {
            warn!(schedule = %entry.name(), error = %e, "Failed to disable schedule");
        }
    }

    /// Evaluate the entry `name`. A spent one-off entry is retired: its
    /// disabled state is written back and it leaves the live map. If that
    /// write fails the entry stays and is checked again shortly.
    pub async fn is_due(&mut self, name: &str) -> Option<ScheduleState> {
        let check = self.entries.get(name)?.is_due();
        let retired = match check.retired {
            Some(retired) => self.retire(retired).await,
            None => true,
        };
        if !retired {
            return Some(ScheduleState::not_due(DISABLED_RECHECK_SECS));
        }
        Some(check.state)
    }

    async fn retire(&mut self, retired: ScheduleEntry) -> bool {
        let name = retired.name().to_string();
        info!(schedule = %name, "Disabling spent one-off schedule");
        let extra = ExtraFields {
            enabled: Some(false),
            total_run_count: Some(0),
        };
        match retired.persist(self.store.as_ref(), extra).await {
            Ok(_) => {
                self.dirty.remove(&name);
                self.entries.remove(&name);
                true
            }
            Err(e) => {
                warn!(schedule = %name, error = %e, "Failed to persist one-off retirement");
                false
            }
        }
    }

    /// Record a run of `name`: swap in the advanced entry and mark it dirty.
    pub fn reserve(&mut self, name: &str) -> Option<ScheduleEntry> {
        let next = self.entries.get(name)?.advance();
        self.entries.insert(name.to_string(), next.clone());
        self.dirty.insert(name.to_string());
        Some(next)
    }

    /// Write every dirty entry back.
    ///
    /// Entries or rows that vanished are dropped. On a storage error the name
    /// being written and every name not yet written stay dirty, and the sync
    /// stops.
    pub async fn sync(&mut self) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if self.dirty.is_empty() {
            return outcome;
        }

        let timer = OpTimer::new("scheduler", "sync");
        let mut pending: Vec<String> = self.dirty.drain().collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));

        while let Some(name) = pending.pop() {
            let Some(entry) = self.entries.get(&name) else {
                error!(schedule = %name, "Cannot save schedule state: entry is no longer loaded");
                outcome.dropped += 1;
                continue;
            };

            match entry.persist(self.store.as_ref(), ExtraFields::default()).await {
                Ok(Some(saved)) => {
                    self.entries.insert(name, saved);
                    outcome.saved += 1;
                }
                Ok(None) => {
                    self.entries.remove(&name);
                    outcome.dropped += 1;
                }
                Err(e) => {
                    warn!(
                        schedule = %name,
                        error = %e,
                        "Schedule store error during sync, will retry"
                    );
                    self.dirty.insert(name);
                    self.dirty.extend(pending.drain(..));
                    outcome.retained = self.dirty.len();
                    break;
                }
            }
        }

        timer.finish_with_count(outcome.saved);
        outcome
    }

    /// Seed every definition of `table`; enabled ones join the live map.
    pub async fn update_from_dict(&mut self, table: &BeatTable) -> Result<(), StoreError> {
        self.sync().await;

        let mut seeded = HashMap::new();
        for (name, definition) in table {
            let entry =
                ScheduleEntry::from_entry(self.store.as_ref(), self.ctx.clone(), name, definition)
                    .await
                    .inspect_err(|e| {
                        error!(schedule = %name, error = %e, "Failed to seed schedule");
                    })?;
            self.quarantine(&entry).await;
            if entry.spec().enabled {
                seeded.insert(name.clone(), entry);
            }
        }

        self.schedule().await;
        self.entries.extend(seeded);
        Ok(())
    }

    /// Seed the built-in entries enabled by configuration.
    pub async fn install_default_entries(&mut self) -> Result<(), StoreError> {
        let mut table = BeatTable::new();
        if self.result_expires.is_some() {
            let (name, definition) = seeds::backend_cleanup();
            table.insert(name, definition);
        }
        self.update_from_dict(&table).await
    }
}
