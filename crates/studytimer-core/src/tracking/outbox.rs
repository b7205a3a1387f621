//! Pending closing writes, keyed by row id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::store::{RemoteStore, StoreWrite};

/// A set of writes to apply in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<StoreWrite>,
    /// Also retry whatever the outbox holds once these are applied.
    pub retry_pending: bool,
}

impl WriteBatch {
    pub fn new(writes: Vec<StoreWrite>) -> Self {
        Self {
            writes,
            retry_pending: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && !self.retry_pending
    }
}

impl From<Vec<StoreWrite>> for WriteBatch {
    fn from(writes: Vec<StoreWrite>) -> Self {
        Self::new(writes)
    }
}

/// Closing writes that failed, waiting for the next sync flush.
///
/// Cloning shares the same queue, so the writer running off the tick path
/// and the tracker see one outbox.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    pending: Arc<Mutex<HashMap<String, StoreWrite>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, StoreWrite>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Pending writes, segments before sessions.
    pub fn snapshot(&self) -> Vec<StoreWrite> {
        let mut writes: Vec<_> = self.pending().values().cloned().collect();
        writes.sort_by_key(|w| match w {
            StoreWrite::Segment(s) => (0, s.started_at),
            StoreWrite::Session(s) => (1, s.started_at),
            StoreWrite::Record(r) => (2, r.started_at),
        });
        writes
    }

    /// Apply a batch. Returns how many writes failed.
    ///
    /// A successful write drops any older pending write for the same id. A
    /// failed closing write replaces it.
    pub fn commit(&self, store: &dyn RemoteStore, batch: WriteBatch) -> usize {
        let mut failed = 0;
        for write in batch.writes {
            if !self.apply_one(store, write) {
                failed += 1;
            }
        }
        if batch.retry_pending {
            failed += self.retry(store);
        }
        failed
    }

    /// Retry everything pending. Returns how many still fail.
    pub fn retry(&self, store: &dyn RemoteStore) -> usize {
        let writes = self.snapshot();
        if writes.is_empty() {
            return 0;
        }
        debug!(count = writes.len(), "retrying pending store writes");
        writes
            .into_iter()
            .filter(|w| {
                let id = w.id().to_string();
                match w.apply(store) {
                    Ok(()) => {
                        // Only drop the entry we retried; a newer one may have landed meanwhile.
                        let mut pending = self.pending();
                        if pending.get(&id) == Some(w) {
                            pending.remove(&id);
                        }
                        false
                    }
                    Err(e) => {
                        warn!(%id, "pending store write failed again: {e}");
                        true
                    }
                }
            })
            .count()
    }

    fn apply_one(&self, store: &dyn RemoteStore, write: StoreWrite) -> bool {
        match write.apply(store) {
            Ok(()) => {
                self.pending().remove(write.id());
                true
            }
            Err(e) => {
                let id = write.id().to_string();
                let mut pending = self.pending();
                if write.is_closing() || pending.contains_key(&id) {
                    warn!(%id, "store write failed, kept for retry: {e}");
                    pending.insert(id, write);
                } else {
                    warn!(%id, "store write failed: {e}");
                }
                false
            }
        }
    }

    /// Persist pending writes to disk.
    pub fn persist(&self, path: &Path) -> Result<(), std::io::Error> {
        let pending = self.pending();
        if pending.is_empty() {
            return match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }
        let data = serde_json::to_string_pretty(&*pending)?;
        std::fs::write(path, data)
    }

    /// Merge pending writes from disk. Entries already queued win.
    pub fn load(&self, path: &Path) -> Result<(), std::io::Error> {
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        let loaded: HashMap<String, StoreWrite> = serde_json::from_str(&content)?;
        let mut pending = self.pending();
        for (id, write) in loaded {
            pending.entry(id).or_insert(write);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{MemoryStore, TimerSession, TopicTimeSegment, TrackingMode};

    fn closed_segment(clock: &ManualClock) -> TopicTimeSegment {
        let session = TimerSession::open("u1", TrackingMode::FreeStudy, clock.now());
        let mut seg = TopicTimeSegment::open(&session, "algebra", clock.now());
        clock.advance_secs(40);
        seg.close(clock.now());
        seg
    }

    #[test]
    fn failed_closing_write_is_retried() {
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let outbox = Outbox::new();
        let seg = closed_segment(&clock);

        store.fail_writes(true);
        assert_eq!(outbox.commit(&store, vec![StoreWrite::Segment(seg.clone())].into()), 1);
        assert_eq!(outbox.len(), 1);

        store.fail_writes(false);
        assert_eq!(outbox.retry(&store), 0);
        assert!(outbox.is_empty());
        assert_eq!(store.all_segments(), vec![seg]);
    }

    #[test]
    fn failed_partial_write_is_dropped() {
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let outbox = Outbox::new();
        let session = TimerSession::open("u1", TrackingMode::FreeStudy, clock.now());

        store.fail_writes(true);
        outbox.commit(&store, vec![StoreWrite::Session(session)].into());
        assert!(outbox.is_empty());
    }

    #[test]
    fn newer_success_supersedes_pending() {
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let outbox = Outbox::new();
        let seg = closed_segment(&clock);

        store.fail_writes(true);
        outbox.commit(&store, vec![StoreWrite::Segment(seg.clone())].into());
        store.fail_writes(false);
        let mut newer = seg;
        newer.duration_seconds = 39;
        outbox.commit(&store, vec![StoreWrite::Segment(newer.clone())].into());
        assert!(outbox.is_empty());
        assert_eq!(store.all_segments(), vec![newer]);
    }

    #[test]
    fn persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let outbox = Outbox::new();

        store.fail_writes(true);
        outbox.commit(&store, vec![StoreWrite::Segment(closed_segment(&clock))].into());
        outbox.persist(&path).unwrap();

        let restored = Outbox::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.snapshot(), outbox.snapshot());

        store.fail_writes(false);
        restored.retry(&store);
        restored.persist(&path).unwrap();
        assert!(!path.exists(), "empty outbox leaves no file");
    }
}
