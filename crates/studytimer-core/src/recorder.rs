//! Focus-time ledger fed by timer events.
//!
//! While a Work interval runs, every whole-minute boundary upserts a partial
//! record; completion upserts the final one under the same key. A failed
//! write is not retried: the next boundary carries a newer value anyway.

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::events::Event;
use crate::store::{RemoteStore, SessionRecord, StoreWrite};
use crate::timer::TimerMode;

pub struct SessionRecorder {
    user_id: String,
    clock: SharedClock,
}

impl SessionRecorder {
    pub fn new(user_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            user_id: user_id.into(),
            clock,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The record an event calls for, if any.
    pub fn observe(&self, event: &Event) -> Option<SessionRecord> {
        match event {
            Event::MinuteElapsed {
                session_started_at,
                full_minutes,
                ..
            } => Some(self.record(*session_started_at, full_minutes.saturating_mul(60), false)),
            Event::TimerCompleted {
                mode: TimerMode::Work,
                duration_secs,
                session_started_at,
                ..
            } => match session_started_at {
                Some(started_at) => Some(self.record(*started_at, *duration_secs, true)),
                None => {
                    debug!("work interval completed without a start time; no record");
                    None
                }
            },
            _ => None,
        }
    }

    /// Same as [`observe`](Self::observe), packaged for the store writer.
    pub fn write_for(&self, event: &Event) -> Option<StoreWrite> {
        self.observe(event).map(StoreWrite::Record)
    }

    /// Observe and write inline. Returns whether a record was stored.
    pub fn handle(&self, event: &Event, store: &dyn RemoteStore) -> bool {
        match self.observe(event) {
            Some(record) => self.write(store, &record),
            None => false,
        }
    }

    pub fn write(&self, store: &dyn RemoteStore, record: &SessionRecord) -> bool {
        match store.upsert_session_record(record) {
            Ok(()) => {
                debug!(id = %record.id, secs = record.duration_seconds, completed = record.completed, "session record written");
                true
            }
            Err(e) => {
                warn!(id = %record.id, "session record write failed: {e}");
                false
            }
        }
    }

    fn record(
        &self,
        started_at: chrono::DateTime<chrono::Utc>,
        duration_seconds: u32,
        completed: bool,
    ) -> SessionRecord {
        SessionRecord {
            id: SessionRecord::key(&self.user_id, started_at),
            user_id: self.user_id.clone(),
            mode: TimerMode::Work,
            started_at,
            duration_seconds,
            completed,
            updated_at: self.clock.now(),
        }
    }
}
