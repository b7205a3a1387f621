use std::sync::Mutex;

use super::{PersistenceStore, TimerSnapshot};
use crate::error::PersistenceError;

/// In-process snapshot slot. Counts writes so tests can assert idempotence.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<TimerSnapshot>>,
    writes: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<TimerSnapshot>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PersistenceStore for MemorySnapshotStore {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        *self.slot() = Some(snapshot.clone());
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<TimerSnapshot>, PersistenceError> {
        Ok(self.slot().clone())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *self.slot() = None;
        Ok(())
    }
}
