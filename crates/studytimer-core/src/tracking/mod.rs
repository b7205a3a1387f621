//! Per-topic time attribution.
//!
//! The tracker owns the user's single open segment. Every operation mutates
//! local state first and returns the store writes that mirror it, so pause,
//! switch and stop always succeed locally even when the store is down.
//!
//! ```text
//! Idle --start--> SessionOpen --resume/start--> SegmentOpen
//!                     ^            <--pause--      |
//!                     |                            | switch = close + open
//! Idle <----------- stop ---------------------------+
//! ```

mod janitor;
mod outbox;
mod syncer;

pub use janitor::{ClosedSegment, Janitor, JanitorReport};
pub use outbox::{Outbox, WriteBatch};
pub use syncer::{SegmentSyncer, DEFAULT_SYNC_INTERVAL_SECS};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_secs, SharedClock};
use crate::error::StoreError;
use crate::events::Event;
use crate::store::{RemoteStore, StoreWrite, TimerSession, TopicTimeSegment, TrackingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Idle,
    SessionOpen,
    SegmentOpen,
}

/// What startup recovery found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Nothing,
    /// An open session with no open segment; the topic waits for resume.
    Session { session_id: String, pending_topic: Option<String> },
    /// An open segment, resumed from its stored start instant.
    Segment { session_id: String, topic_id: String, started_at: DateTime<Utc> },
}

/// Live segment for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSegment {
    pub session_id: String,
    pub topic_id: String,
    pub segment_started_at: DateTime<Utc>,
    pub elapsed_seconds: u32,
}

pub struct TopicSegmentTracker {
    user_id: String,
    clock: SharedClock,
    session: Option<TimerSession>,
    segment: Option<TopicTimeSegment>,
    pending_topic: Option<String>,
    /// Durations of this session's segments already closed.
    closed_seconds: u64,
    /// Whether the engine is running a Work interval, as last observed.
    work_running: bool,
    outbox: Outbox,
}

impl TopicSegmentTracker {
    pub fn new(user_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            user_id: user_id.into(),
            clock,
            session: None,
            segment: None,
            pending_topic: None,
            closed_seconds: 0,
            work_running: false,
            outbox: Outbox::new(),
        }
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn state(&self) -> TrackerState {
        match (&self.session, &self.segment) {
            (None, _) => TrackerState::Idle,
            (Some(_), None) => TrackerState::SessionOpen,
            (Some(_), Some(_)) => TrackerState::SegmentOpen,
        }
    }

    pub fn session(&self) -> Option<&TimerSession> {
        self.session.as_ref()
    }

    pub fn open_segment(&self) -> Option<&TopicTimeSegment> {
        self.segment.as_ref()
    }

    pub fn pending_topic(&self) -> Option<&str> {
        self.pending_topic.as_deref()
    }

    pub fn live_view(&self) -> Option<LiveSegment> {
        let segment = self.segment.as_ref()?;
        Some(LiveSegment {
            session_id: segment.timer_session_id.clone(),
            topic_id: segment.topic_id.clone(),
            segment_started_at: segment.started_at,
            elapsed_seconds: elapsed_secs(segment.started_at, self.clock.now()),
        })
    }

    // ── Control surface ──────────────────────────────────────────────

    /// Begin tracking `topic_id`, opening a session if none is open.
    ///
    /// A pomodoro session only opens its segment while a Work interval runs;
    /// otherwise the topic waits for the next `TimerStarted`.
    pub fn start_timer(&mut self, topic_id: &str, mode: TrackingMode) -> Vec<StoreWrite> {
        let now = self.clock.now();
        let mut writes = Vec::new();

        match &self.session {
            Some(existing) if existing.mode != mode => {
                debug!(session = %existing.id, "session already open, keeping its tracking mode");
            }
            Some(_) => {}
            None => {
                let session = TimerSession::open(&self.user_id, mode, now);
                info!(session = %session.id, %mode, "tracking session opened");
                writes.push(StoreWrite::Session(session.clone()));
                self.closed_seconds = 0;
                self.session = Some(session);
            }
        }
        let session_mode = self.session.as_ref().map_or(mode, |s| s.mode);

        self.pending_topic = Some(topic_id.to_string());
        let opens_now = session_mode == TrackingMode::FreeStudy || self.work_running;
        if opens_now {
            writes.extend(self.open_segment_at(topic_id, now));
        } else if let Some(write) = self.close_segment_at(now) {
            writes.push(write);
        }
        writes
    }

    /// Close the open segment and open one for `topic_id` in the same session.
    /// With no open segment this only changes the topic the next resume uses.
    pub fn switch_topic(&mut self, topic_id: &str) -> Vec<StoreWrite> {
        self.pending_topic = Some(topic_id.to_string());
        if self.segment.is_none() {
            debug!(topic = topic_id, "no open segment, topic pending until resume");
            return Vec::new();
        }
        if self.segment.as_ref().is_some_and(|s| s.topic_id == topic_id) {
            return Vec::new();
        }
        let now = self.clock.now();
        self.open_segment_at(topic_id, now)
    }

    /// Close the open segment, keeping the session.
    pub fn pause_timer(&mut self) -> Vec<StoreWrite> {
        let now = self.clock.now();
        self.close_segment_at(now).into_iter().collect()
    }

    /// Open a segment for the last-known topic. No-op when one is open.
    pub fn resume_timer(&mut self) -> Vec<StoreWrite> {
        if self.session.is_none() || self.segment.is_some() {
            return Vec::new();
        }
        let Some(topic_id) = self.pending_topic.clone() else {
            debug!("resume without a known topic");
            return Vec::new();
        };
        let now = self.clock.now();
        self.open_segment_at(&topic_id, now)
    }

    /// Close the open segment and the session.
    pub fn stop_timer(&mut self) -> Vec<StoreWrite> {
        let now = self.clock.now();
        let mut writes: Vec<_> = self.close_segment_at(now).into_iter().collect();
        if let Some(mut session) = self.session.take() {
            session.ended_at = Some(now);
            session.total_seconds = u32::try_from(self.closed_seconds).unwrap_or(u32::MAX);
            info!(session = %session.id, total = session.total_seconds, "tracking session closed");
            writes.push(StoreWrite::Session(session));
        }
        self.pending_topic = None;
        self.closed_seconds = 0;
        writes
    }

    /// Follow engine transitions. Only pomodoro sessions react.
    pub fn on_timer_event(&mut self, event: &Event) -> Vec<StoreWrite> {
        let resume = match event {
            Event::TimerStarted { mode, .. } => {
                self.work_running = mode.is_work();
                self.work_running
            }
            Event::TimerPaused { .. }
            | Event::TimerReset { .. }
            | Event::ModeChanged { .. }
            | Event::TimerCompleted { .. } => {
                self.work_running = false;
                false
            }
            Event::Tick { .. } | Event::MinuteElapsed { .. } | Event::SettingsChanged { .. } => {
                return Vec::new()
            }
        };

        let follows_timer = self
            .session
            .as_ref()
            .is_some_and(|s| s.mode == TrackingMode::Pomodoro);
        if !follows_timer {
            return Vec::new();
        }
        if resume {
            self.resume_timer()
        } else {
            self.pause_timer()
        }
    }

    /// Seed what the tracker knows about the engine, e.g. after restoring it.
    pub fn set_work_running(&mut self, running: bool) {
        self.work_running = running;
    }

    /// Partial update of the open segment with its current elapsed time.
    pub fn sync_write(&mut self) -> Option<StoreWrite> {
        let now = self.clock.now();
        let segment = self.segment.as_mut()?;
        segment.duration_seconds = elapsed_secs(segment.started_at, now);
        Some(StoreWrite::Segment(segment.clone()))
    }

    // ── Queries and recovery ─────────────────────────────────────────

    /// Closed time for a topic plus the live elapsed time if it is open.
    ///
    /// Closing writes still waiting in the outbox are counted too.
    pub fn topic_total_seconds(
        &self,
        store: &dyn RemoteStore,
        topic_id: &str,
    ) -> Result<u64, StoreError> {
        let stored = store.closed_topic_seconds(&self.user_id, topic_id)?;
        let pending: u64 = self
            .outbox
            .snapshot()
            .iter()
            .filter_map(|w| match w {
                StoreWrite::Segment(s)
                    if !s.is_open() && s.topic_id == topic_id && s.user_id == self.user_id =>
                {
                    Some(u64::from(s.duration_seconds))
                }
                _ => None,
            })
            .sum();
        let live = self
            .live_view()
            .filter(|live| live.topic_id == topic_id)
            .map_or(0, |live| u64::from(live.elapsed_seconds));
        Ok(stored + pending + live)
    }

    /// Pick up a session left open by a previous process.
    ///
    /// An open segment keeps its stored `started_at`, so elapsed time spans
    /// the time the process was gone.
    pub fn recover(&mut self, store: &dyn RemoteStore) -> Result<Recovery, StoreError> {
        let Some(session) = store.query_open_session(&self.user_id)? else {
            debug!(user = %self.user_id, "no open tracking session to recover");
            return Ok(Recovery::Nothing);
        };
        let segments = store.segments_for_session(&session.id)?;
        let open = store.query_open_segment(&session.id)?;

        self.closed_seconds = segments
            .iter()
            .filter(|s| !s.is_open())
            .map(|s| u64::from(s.duration_seconds))
            .sum();
        let session_id = session.id.clone();
        self.session = Some(session);

        let recovery = match open {
            Some(segment) => {
                info!(session = %session_id, topic = %segment.topic_id, started_at = %segment.started_at, "recovered open segment");
                self.pending_topic = Some(segment.topic_id.clone());
                let recovery = Recovery::Segment {
                    session_id,
                    topic_id: segment.topic_id.clone(),
                    started_at: segment.started_at,
                };
                self.segment = Some(segment);
                recovery
            }
            None => {
                self.segment = None;
                self.pending_topic = segments.last().map(|s| s.topic_id.clone());
                info!(session = %session_id, topic = ?self.pending_topic, "recovered open session");
                Recovery::Session {
                    session_id,
                    pending_topic: self.pending_topic.clone(),
                }
            }
        };
        Ok(recovery)
    }

    /// Apply writes inline, queueing failed closing writes for retry.
    pub fn commit(&self, store: &dyn RemoteStore, writes: Vec<StoreWrite>) -> usize {
        self.outbox.commit(store, WriteBatch::new(writes))
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Close-then-open. An already open segment is closed first, so at most
    /// one is ever open.
    fn open_segment_at(&mut self, topic_id: &str, now: DateTime<Utc>) -> Vec<StoreWrite> {
        let mut writes = Vec::new();
        let Some(session) = &self.session else {
            return writes;
        };
        let segment = TopicTimeSegment::open(session, topic_id, now);

        if let Some(stale) = &self.segment {
            if stale.topic_id == topic_id && stale.timer_session_id == session.id {
                return writes;
            }
            warn!(segment = %stale.id, "segment already open, closing it before opening another");
        }
        if let Some(closed) = self.close_segment_at(now) {
            writes.push(closed);
        }

        debug!(segment = %segment.id, topic = topic_id, "segment opened");
        writes.push(StoreWrite::Segment(segment.clone()));
        self.segment = Some(segment);
        writes
    }

    fn close_segment_at(&mut self, now: DateTime<Utc>) -> Option<StoreWrite> {
        let mut segment = self.segment.take()?;
        segment.close(now);
        self.closed_seconds += u64::from(segment.duration_seconds);
        debug!(segment = %segment.id, secs = segment.duration_seconds, "segment closed");
        Some(StoreWrite::Segment(segment))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;
    use crate::timer::TimerMode;

    struct Fixture {
        clock: ManualClock,
        store: MemoryStore,
        tracker: TopicSegmentTracker,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let tracker = TopicSegmentTracker::new("u1", Arc::new(clock.clone()));
        Fixture {
            clock,
            store: MemoryStore::new(),
            tracker,
        }
    }

    impl Fixture {
        fn run(&mut self, writes: Vec<StoreWrite>) {
            self.tracker.commit(&self.store, writes);
        }

        fn open_count(&self) -> usize {
            self.store.all_segments().iter().filter(|s| s.is_open()).count()
        }
    }

    fn started(clock: &ManualClock, mode: TimerMode) -> Event {
        Event::TimerStarted {
            mode,
            remaining_secs: 1500,
            session_started_at: clock.now(),
            at: clock.now(),
        }
    }

    fn paused(clock: &ManualClock) -> Event {
        Event::TimerPaused {
            mode: TimerMode::Work,
            remaining_secs: 1000,
            at: clock.now(),
        }
    }

    #[test]
    fn free_study_lifecycle() {
        let mut f = fixture();
        assert_eq!(f.tracker.state(), TrackerState::Idle);

        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::SegmentOpen);
        assert_eq!(f.open_count(), 1);

        f.clock.advance_secs(30);
        let w = f.tracker.switch_topic("physics");
        f.run(w);
        assert_eq!(f.open_count(), 1);

        f.clock.advance_secs(20);
        let w = f.tracker.pause_timer();
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::SessionOpen);
        assert_eq!(f.open_count(), 0);

        f.clock.advance_secs(100);
        let w = f.tracker.resume_timer();
        f.run(w);
        assert_eq!(f.tracker.open_segment().unwrap().topic_id, "physics");

        f.clock.advance_secs(10);
        let w = f.tracker.stop_timer();
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::Idle);

        let session = &f.store.all_sessions()[0];
        assert!(!session.is_open());
        assert_eq!(session.total_seconds, 60);
        let sum: u32 = f.store.all_segments().iter().map(|s| s.duration_seconds).sum();
        assert_eq!(sum, 60);
        assert_eq!(f.store.closed_topic_seconds("u1", "physics").unwrap(), 30);
    }

    #[test]
    fn switch_while_paused_only_changes_pending_topic() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        let w = f.tracker.pause_timer();
        f.run(w);
        let before = f.store.write_count();

        assert!(f.tracker.switch_topic("history").is_empty());
        assert_eq!(f.store.write_count(), before);
        assert_eq!(f.tracker.pending_topic(), Some("history"));

        let w = f.tracker.resume_timer();
        f.run(w);
        assert_eq!(f.tracker.open_segment().unwrap().topic_id, "history");
    }

    #[test]
    fn second_start_auto_heals_open_segment() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        f.clock.advance_secs(5);
        let w = f.tracker.start_timer("physics", TrackingMode::FreeStudy);
        f.run(w);
        assert_eq!(f.open_count(), 1);
        assert_eq!(f.store.all_sessions().len(), 1);
        assert_eq!(f.store.closed_topic_seconds("u1", "algebra").unwrap(), 5);
    }

    #[test]
    fn pomodoro_session_follows_work_intervals() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::Pomodoro);
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::SessionOpen, "timer not running yet");

        let w = f.tracker.on_timer_event(&started(&f.clock, TimerMode::Work));
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::SegmentOpen);

        f.clock.advance_secs(90);
        let w = f.tracker.on_timer_event(&paused(&f.clock));
        f.run(w);
        assert_eq!(f.tracker.state(), TrackerState::SessionOpen);

        let w = f.tracker.on_timer_event(&started(&f.clock, TimerMode::Break));
        assert!(w.is_empty(), "breaks are not attributed to a topic");
        assert_eq!(f.store.closed_topic_seconds("u1", "algebra").unwrap(), 90);
    }

    #[test]
    fn free_study_ignores_timer_events() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        assert!(f.tracker.on_timer_event(&paused(&f.clock)).is_empty());
        assert_eq!(f.tracker.state(), TrackerState::SegmentOpen);
    }

    #[test]
    fn topic_total_includes_live_elapsed() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        f.clock.advance_secs(40);
        let w = f.tracker.pause_timer();
        f.run(w);
        let w = f.tracker.resume_timer();
        f.run(w);
        f.clock.advance_secs(15);

        assert_eq!(f.tracker.topic_total_seconds(&f.store, "algebra").unwrap(), 55);
        assert_eq!(f.tracker.topic_total_seconds(&f.store, "physics").unwrap(), 0);
    }

    #[test]
    fn failed_close_stays_local_and_is_counted() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        f.clock.advance_secs(25);
        f.store.fail_writes(true);
        let w = f.tracker.pause_timer();
        f.run(w);

        assert_eq!(f.tracker.state(), TrackerState::SessionOpen);
        assert_eq!(f.tracker.outbox().len(), 1);
        assert_eq!(f.tracker.topic_total_seconds(&f.store, "algebra").unwrap(), 25);

        f.store.fail_writes(false);
        assert_eq!(f.tracker.outbox().retry(&f.store), 0);
        assert_eq!(f.open_count(), 0);
    }

    #[test]
    fn recovery_uses_stored_segment_start() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        let segment_start = f.tracker.open_segment().unwrap().started_at;

        // Process dies; a new one starts ten minutes later.
        f.clock.advance_secs(600);
        let mut next = TopicSegmentTracker::new("u1", Arc::new(f.clock.clone()));
        let recovery = next.recover(&f.store).unwrap();
        assert!(matches!(recovery, Recovery::Segment { ref topic_id, started_at, .. }
            if topic_id == "algebra" && started_at == segment_start));
        assert_eq!(next.live_view().unwrap().elapsed_seconds, 600);

        let w = next.stop_timer();
        next.commit(&f.store, w);
        assert_eq!(f.store.all_sessions()[0].total_seconds, 600);
    }

    #[test]
    fn recovery_without_open_segment_restores_pending_topic() {
        let mut f = fixture();
        let w = f.tracker.start_timer("algebra", TrackingMode::FreeStudy);
        f.run(w);
        f.clock.advance_secs(5);
        let w = f.tracker.switch_topic("physics");
        f.run(w);
        f.clock.advance_secs(5);
        let w = f.tracker.pause_timer();
        f.run(w);

        let mut next = TopicSegmentTracker::new("u1", Arc::new(f.clock.clone()));
        let recovery = next.recover(&f.store).unwrap();
        assert!(matches!(recovery, Recovery::Session { pending_topic: Some(ref t), .. } if t == "physics"));

        let w = next.resume_timer();
        next.commit(&f.store, w);
        f.clock.advance_secs(5);
        let w = next.stop_timer();
        next.commit(&f.store, w);
        assert_eq!(f.store.all_sessions()[0].total_seconds, 15);
    }

    #[test]
    fn recovery_with_nothing_open() {
        let mut f = fixture();
        assert_eq!(f.tracker.recover(&f.store).unwrap(), Recovery::Nothing);
    }
}
