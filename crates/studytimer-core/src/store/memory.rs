use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{RemoteStore, SessionRecord, TimerSession, TopicTimeSegment};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, TimerSession>,
    segments: HashMap<String, TopicTimeSegment>,
    records: HashMap<String, SessionRecord>,
}

/// In-memory [`RemoteStore`] with switchable write failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StoreError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn all_segments(&self) -> Vec<TopicTimeSegment> {
        let mut segments: Vec<_> = self.tables().segments.values().cloned().collect();
        segments.sort_by_key(|s| s.started_at);
        segments
    }

    pub fn all_sessions(&self) -> Vec<TimerSession> {
        let mut sessions: Vec<_> = self.tables().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write<F: FnOnce(&mut Tables)>(&self, f: F) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        f(&mut self.tables());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl RemoteStore for MemoryStore {
    fn upsert_session(&self, session: &TimerSession) -> Result<(), StoreError> {
        self.write(|t| {
            t.sessions.insert(session.id.clone(), session.clone());
        })
    }

    fn upsert_segment(&self, segment: &TopicTimeSegment) -> Result<(), StoreError> {
        self.write(|t| {
            // Closed rows are final.
            let closed = t.segments.get(&segment.id).is_some_and(|s| !s.is_open());
            if !closed {
                t.segments.insert(segment.id.clone(), segment.clone());
            }
        })
    }

    fn query_open_session(&self, user_id: &str) -> Result<Option<TimerSession>, StoreError> {
        Ok(self
            .tables()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_open())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    fn query_open_segment(&self, session_id: &str) -> Result<Option<TopicTimeSegment>, StoreError> {
        Ok(self
            .tables()
            .segments
            .values()
            .filter(|s| s.timer_session_id == session_id && s.is_open())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    fn upsert_session_record(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.write(|t| {
            t.records.insert(record.id.clone(), record.clone());
        })
    }

    fn session(&self, session_id: &str) -> Result<Option<TimerSession>, StoreError> {
        Ok(self.tables().sessions.get(session_id).cloned())
    }

    fn segments_for_session(&self, session_id: &str) -> Result<Vec<TopicTimeSegment>, StoreError> {
        let mut segments: Vec<_> = self
            .tables()
            .segments
            .values()
            .filter(|s| s.timer_session_id == session_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.started_at);
        Ok(segments)
    }

    fn closed_topic_seconds(&self, user_id: &str, topic_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .segments
            .values()
            .filter(|s| s.user_id == user_id && s.topic_id == topic_id && !s.is_open())
            .map(|s| u64::from(s.duration_seconds))
            .sum())
    }

    fn open_segments(&self) -> Result<Vec<TopicTimeSegment>, StoreError> {
        let mut segments: Vec<_> = self
            .tables()
            .segments
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.started_at);
        Ok(segments)
    }

    fn session_record(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.tables().records.get(id).cloned())
    }
}
