//! Periodic partial writes of the open segment.
//!
//! Bounds what an ungraceful exit can lose to one sync interval, and keeps
//! `duration_seconds` of an open segment meaningful for the janitor.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::outbox::WriteBatch;
use super::TopicSegmentTracker;
use crate::store::RemoteStore;

pub const DEFAULT_SYNC_INTERVAL_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct SegmentSyncer {
    interval: Duration,
    last_flush: Option<DateTime<Utc>>,
}

impl Default for SegmentSyncer {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_SYNC_INTERVAL_SECS))
    }
}

impl SegmentSyncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.last_flush
            .map_or(true, |last| now - last >= self.interval)
    }

    /// The batch to write now, if the interval has elapsed.
    ///
    /// Carries the open segment's current duration and a retry of the outbox.
    /// The first call only starts the interval.
    pub fn poll(&mut self, tracker: &mut TopicSegmentTracker, now: DateTime<Utc>) -> Option<WriteBatch> {
        let Some(last) = self.last_flush else {
            self.last_flush = Some(now);
            return None;
        };
        if now - last < self.interval {
            return None;
        }
        self.last_flush = Some(now);
        if tracker.open_segment().is_none() && tracker.outbox().is_empty() {
            return None;
        }
        let batch = self.batch(tracker);
        debug!(writes = batch.writes.len(), pending = tracker.outbox().len(), "segment sync due");
        Some(batch)
    }

    /// Write the open segment's duration and retry pending writes, inline.
    /// Returns how many writes failed.
    pub fn flush(&mut self, tracker: &mut TopicSegmentTracker, store: &dyn RemoteStore, now: DateTime<Utc>) -> usize {
        self.last_flush = Some(now);
        let batch = self.batch(tracker);
        tracker.outbox().commit(store, batch)
    }

    /// Restart the interval, e.g. when a segment opens.
    pub fn restart(&mut self, now: DateTime<Utc>) {
        self.last_flush = Some(now);
    }

    fn batch(&self, tracker: &mut TopicSegmentTracker) -> WriteBatch {
        WriteBatch {
            writes: tracker.sync_write().into_iter().collect(),
            retry_pending: true,
        }
    }
}
