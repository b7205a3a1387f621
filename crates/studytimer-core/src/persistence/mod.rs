//! Durable local snapshot of the timer engine.
//!
//! Backends implement [`PersistenceStore`]; the engine talks to them through
//! [`Snapshots`], which applies the staleness rule so that every backend
//! discards old state the same way.

mod file;
mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::PersistenceError;
use crate::timer::TimerMode;

/// Snapshots older than this never restore.
pub const DEFAULT_STALENESS_MINUTES: i64 = 30;

/// Current on-disk format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub mode: TimerMode,
    pub time_remaining_seconds: u32,
    pub is_running: bool,
    pub session_start_time: Option<DateTime<Utc>>,
    pub current_session_index: u32,
    pub last_recorded_full_minutes: u32,
    pub saved_at: DateTime<Utc>,
}

/// A snapshot taken now and written later, keeping its place in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub ticket: u64,
    pub snapshot: TimerSnapshot,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// A place to keep one [`TimerSnapshot`].
pub trait PersistenceStore: Send + Sync {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError>;

    fn load(&self) -> Result<Option<TimerSnapshot>, PersistenceError>;

    fn clear(&self) -> Result<(), PersistenceError>;

    /// Synchronous best-effort write used when the process is going away.
    fn save_blocking(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.save(snapshot)
    }
}

/// Staleness-aware handle over a [`PersistenceStore`].
#[derive(Clone)]
pub struct Snapshots {
    backend: Arc<dyn PersistenceStore>,
    clock: SharedClock,
    staleness: Duration,
    /// Ticket of the newest snapshot written, shared by clones.
    newest: Arc<Mutex<u64>>,
    tickets: Arc<AtomicU64>,
}

impl Snapshots {
    pub fn new(backend: Arc<dyn PersistenceStore>, clock: SharedClock) -> Self {
        Self {
            backend,
            clock,
            staleness: Duration::minutes(DEFAULT_STALENESS_MINUTES),
            newest: Arc::new(Mutex::new(0)),
            tickets: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Reserve a place in write order. Take it when the snapshot is taken.
    pub fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn save(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.save_ticketed(self.ticket(), snapshot)
    }

    /// Write a snapshot unless one with a later ticket was already written.
    ///
    /// Periodic saves run off the tick path and can arrive after a newer
    /// save made inline.
    pub fn save_ticketed(&self, ticket: u64, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.write(ticket, snapshot, |backend| backend.save(snapshot))
    }

    pub fn save_pending(&self, pending: &PendingSnapshot) -> Result<(), PersistenceError> {
        self.save_ticketed(pending.ticket, &pending.snapshot)
    }

    pub fn save_blocking(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.write(self.ticket(), snapshot, |backend| backend.save_blocking(snapshot))
    }

    fn write<F>(&self, ticket: u64, snapshot: &TimerSnapshot, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&dyn PersistenceStore) -> Result<(), PersistenceError>,
    {
        let mut newest = self.newest.lock().unwrap_or_else(|e| e.into_inner());
        if ticket < *newest {
            debug!(ticket, newest = *newest, "skipping superseded timer snapshot");
            return Ok(());
        }
        f(self.backend.as_ref())?;
        *newest = ticket;
        debug!(
            mode = %snapshot.mode,
            remaining = snapshot.time_remaining_seconds,
            running = snapshot.is_running,
            "timer snapshot saved"
        );
        Ok(())
    }

    /// Load a snapshot fit for restoration.
    ///
    /// Stale, future-versioned or unreadable snapshots are discarded and
    /// `None` is returned; the caller falls back to fresh defaults.
    pub fn load(&self) -> Option<TimerSnapshot> {
        let snapshot = match self.backend.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!("discarding unreadable timer snapshot: {e}");
                self.discard();
                return None;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            info!(version = snapshot.version, "discarding snapshot with unknown version");
            self.discard();
            return None;
        }

        let age = self.clock.now() - snapshot.saved_at;
        if age > self.staleness {
            info!(
                age_secs = age.num_seconds(),
                "discarding stale timer snapshot"
            );
            self.discard();
            return None;
        }

        Some(snapshot)
    }

    pub fn clear(&self) -> Result<(), PersistenceError> {
        let mut newest = self.newest.lock().unwrap_or_else(|e| e.into_inner());
        self.backend.clear()?;
        // Writes queued before the clear must not bring the snapshot back.
        *newest = self.ticket();
        Ok(())
    }

    fn discard(&self) {
        if let Err(e) = self.backend.clear() {
            warn!("failed to clear discarded snapshot: {e}");
        }
    }
}
