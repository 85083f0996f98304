// 🔄 Mirror Synchronizer - keeps the external sheet roughly in step with the local store
//
// Push model: full snapshot, throttled by a cooldown measured from the last successful
// push. Changes arriving inside the cooldown are deferred to the periodic tick, never
// dropped. Approvals also get a best-effort point patch outside the throttle.

use crate::config::MirrorConfig;
use crate::db::RegistryStore;
use crate::error::RegistryResult;
use crate::mirror::{Mirror, MirrorRecord};
use crate::model::Status;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Something in the store changed; consider a snapshot push
    RowsChanged,
    /// One registrant's status changed; patch that record directly
    StatusChanged { full_name: String, status: Status },
}

/// Fire-and-forget sender held by the registrar and the approval tracker.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    tx: Option<UnboundedSender<SyncEvent>>,
}

impl SyncHandle {
    /// Handle with no synchronizer behind it (CLI, tests). Events are dropped;
    /// the next snapshot push still carries the change.
    pub fn detached() -> Self {
        SyncHandle { tx: None }
    }

    pub fn rows_changed(&self) {
        self.send(SyncEvent::RowsChanged);
    }

    pub fn status_changed(&self, full_name: &str, status: Status) {
        self.send(SyncEvent::StatusChanged {
            full_name: full_name.to_string(),
            status,
        });
    }

    fn send(&self, event: SyncEvent) {
        match &self.tx {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("synchronizer stopped; change left for the next push");
                }
            }
            None => debug!(?event, "no synchronizer attached"),
        }
    }
}

pub fn channel() -> (SyncHandle, UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SyncHandle { tx: Some(tx) }, rx)
}

// ============================================================================
// THROTTLE
// ============================================================================

/// Minimum interval between successful pushes. Time is passed in explicitly.
#[derive(Debug, Clone)]
pub struct Throttle {
    cooldown: Duration,
    last_push: Option<Instant>,
}

impl Throttle {
    pub fn new(cooldown: Duration) -> Self {
        Throttle {
            cooldown,
            last_push: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_push {
            None => Duration::ZERO,
            Some(last) => self
                .cooldown
                .saturating_sub(now.saturating_duration_since(last)),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_push = Some(now);
    }

    pub fn last_push(&self) -> Option<Instant> {
        self.last_push
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed { rows: usize },
    /// Inside the cooldown; the tick will retry
    Deferred { remaining: Duration },
    /// Nothing changed since the last push (or the store is empty)
    Clean,
    /// Store or mirror failure; already logged
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Local store already had rows; mirror not consulted
    NotNeeded,
    Restored {
        fetched: usize,
        imported: usize,
        rejected: usize,
    },
    /// Mirror fetch failed; starting empty
    Unavailable,
}

// ============================================================================
// SYNCHRONIZER
// ============================================================================

pub struct MirrorSynchronizer {
    store: Arc<RegistryStore>,
    mirror: Arc<dyn Mirror>,
    throttle: Throttle,
    /// Store cursor covered by the last successful push (or recovery)
    synced_cursor: Option<DateTime<Utc>>,
    tick: Duration,
}

impl MirrorSynchronizer {
    pub fn new(
        store: Arc<RegistryStore>,
        mirror: Arc<dyn Mirror>,
        cooldown: Duration,
        tick: Duration,
    ) -> Self {
        MirrorSynchronizer {
            store,
            mirror,
            throttle: Throttle::new(cooldown),
            synced_cursor: None,
            tick,
        }
    }

    pub fn from_config(
        store: Arc<RegistryStore>,
        mirror: Arc<dyn Mirror>,
        config: &MirrorConfig,
    ) -> Self {
        Self::new(store, mirror, config.push_cooldown(), config.tick_interval())
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Cold-start recovery. Only runs when the local store is empty; rows are
    /// inserted if absent, so an existing local row is never overwritten.
    pub async fn recover(&mut self) -> RegistryResult<RecoveryOutcome> {
        if !self.store.is_empty()? {
            debug!("local store has rows; skipping mirror recovery");
            return Ok(RecoveryOutcome::NotNeeded);
        }

        let records = match self.mirror.fetch_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(mirror = %self.mirror.describe(), error = %e, "mirror recovery failed; starting empty");
                return Ok(RecoveryOutcome::Unavailable);
            }
        };

        let fetched = records.len();
        let (imported, rejected) = self.import_records(&records)?;
        info!(fetched, imported, rejected, "restored registrations from mirror");

        Ok(RecoveryOutcome::Restored {
            fetched,
            imported,
            rejected,
        })
    }

    /// Insert mirror records the store does not have yet. Returns (imported, rejected).
    pub fn import_records(&mut self, records: &[MirrorRecord]) -> RegistryResult<(usize, usize)> {
        let now = Utc::now();
        let mut rows = Vec::with_capacity(records.len());
        let mut rejected = 0;

        for record in records {
            match record.to_registrant(now) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    rejected += 1;
                    warn!(%reason, "skipping mirror record");
                }
            }
        }

        let was_empty = self.store.is_empty()?;
        let imported = self.store.insert_if_absent(&rows)?;
        if was_empty {
            // The mirror already holds everything that was just imported
            self.synced_cursor = self.store.max_last_updated()?;
        }
        Ok((imported, rejected))
    }

    /// True when the store has rows newer than the last push. An empty store is
    /// never dirty, so a wiped store cannot blank out the mirror.
    pub fn is_dirty(&self) -> RegistryResult<bool> {
        let cursor = self.store.max_last_updated()?;
        Ok(cursor.is_some() && cursor != self.synced_cursor)
    }

    /// Push if something changed and the cooldown has elapsed; otherwise defer.
    pub async fn maybe_push(&mut self, now: Instant) -> PushOutcome {
        match self.is_dirty() {
            Ok(true) => {}
            Ok(false) => return PushOutcome::Clean,
            Err(e) => {
                warn!(error = %e, "could not read sync cursor");
                return PushOutcome::Failed;
            }
        }

        if !self.throttle.ready(now) {
            let remaining = self.throttle.remaining(now);
            debug!(remaining_secs = remaining.as_secs(), "mirror push deferred by cooldown");
            return PushOutcome::Deferred { remaining };
        }

        self.push(now).await
    }

    /// Push a pending change regardless of the cooldown.
    pub async fn flush(&mut self, now: Instant) -> PushOutcome {
        match self.is_dirty() {
            Ok(true) => self.push(now).await,
            Ok(false) => PushOutcome::Clean,
            Err(e) => {
                warn!(error = %e, "could not read sync cursor");
                PushOutcome::Failed
            }
        }
    }

    async fn push(&mut self, now: Instant) -> PushOutcome {
        let (rows, cursor) = match self.store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "could not read registry snapshot");
                return PushOutcome::Failed;
            }
        };

        if rows.is_empty() {
            return PushOutcome::Clean;
        }

        let records: Vec<MirrorRecord> = rows.iter().map(MirrorRecord::from).collect();
        match self.mirror.push_snapshot(&records).await {
            Ok(()) => {
                self.throttle.record(now);
                self.synced_cursor = cursor;
                info!(rows = records.len(), mirror = %self.mirror.describe(), "snapshot pushed to mirror");
                PushOutcome::Pushed {
                    rows: records.len(),
                }
            }
            Err(e) => {
                warn!(mirror = %self.mirror.describe(), error = %e, "snapshot push failed; retrying on next tick");
                PushOutcome::Failed
            }
        }
    }

    /// Best-effort point update, off the loop so a slow mirror does not hold up pushes.
    fn spawn_patch(&self, full_name: String, status: Status) {
        let mirror = Arc::clone(&self.mirror);
        tokio::spawn(async move {
            match mirror.patch_status(&full_name, status).await {
                Ok(()) => debug!(name = %full_name, %status, "mirror record patched"),
                Err(e) => warn!(name = %full_name, error = %e, "mirror status patch failed"),
            }
        });
    }

    /// Event/tick loop. Ends when every `SyncHandle` is dropped, after one final flush.
    pub async fn run(mut self, mut events: UnboundedReceiver<SyncEvent>) {
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SyncEvent::RowsChanged) => {
                        self.maybe_push(Instant::now()).await;
                    }
                    Some(SyncEvent::StatusChanged { full_name, status }) => {
                        self.spawn_patch(full_name, status);
                    }
                    None => {
                        debug!("sync channel closed; flushing pending changes");
                        self.flush(Instant::now()).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.maybe_push(Instant::now()).await;
                }
            }
        }
    }

    pub fn spawn(self, events: UnboundedReceiver<SyncEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }
}
