//! Timer engine implementation.
//!
//! The timer engine is a wall-clock-based state machine. It does not use
//! internal threads - the caller (usually [`crate::TimerService`]) is
//! responsible for calling `tick()` periodically. Remaining time is always
//! recomputed from an absolute end instant, so late, coalesced or skipped
//! ticks never distort it.
//!
//! ## Mode cycle
//!
//! ```text
//! Work -> Break -> Work -> Break -> ... -> Work -> LongBreak -> Work
//!                  (every Nth completed Work interval earns LongBreak)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let mut engine = TimerEngine::restore(settings, clock, snapshots);
//! engine.start();
//! // In a loop:
//! let events = engine.tick(); // contains TimerCompleted when the interval ends
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::mode::TimerMode;
use super::settings::TimerSettings;
use crate::clock::SharedClock;
use crate::events::Event;
use crate::persistence::{PendingSnapshot, Snapshots, TimerSnapshot, SNAPSHOT_VERSION};

/// How often a running engine offers a periodic snapshot.
pub const DEFAULT_SAVE_INTERVAL_SECS: i64 = 5;

/// Read-only live view for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub mode: TimerMode,
    pub is_running: bool,
    pub time_remaining_seconds: u32,
    pub progress_percent: f64,
}

/// Core timer engine.
pub struct TimerEngine {
    settings: Arc<TimerSettings>,
    /// Settings received while running; applied on the next reset,
    /// mode change or completion.
    pending_settings: Option<Arc<TimerSettings>>,
    clock: SharedClock,
    snapshots: Snapshots,
    save_interval: Duration,

    mode: TimerMode,
    is_running: bool,
    /// Authoritative while paused; refreshed from `target_end` while running.
    remaining_secs: u32,
    target_end: Option<DateTime<Utc>>,
    session_start_time: Option<DateTime<Utc>>,
    current_session_index: u32,
    last_recorded_full_minutes: u32,
    last_saved_at: Option<DateTime<Utc>>,
    /// Bumped on every start; lets a tick task detect it belongs to an older run.
    run_id: u64,
}

impl TimerEngine {
    /// Fresh engine: Work mode, full duration, not running.
    pub fn new(settings: Arc<TimerSettings>, clock: SharedClock, snapshots: Snapshots) -> Self {
        let remaining_secs = settings.duration_secs(TimerMode::Work);
        Self {
            settings,
            pending_settings: None,
            clock,
            snapshots,
            save_interval: Duration::seconds(DEFAULT_SAVE_INTERVAL_SECS),
            mode: TimerMode::Work,
            is_running: false,
            remaining_secs,
            target_end: None,
            session_start_time: None,
            current_session_index: 0,
            last_recorded_full_minutes: 0,
            last_saved_at: None,
            run_id: 0,
        }
    }

    /// Build an engine from the persisted snapshot, or fresh defaults when
    /// there is none (or it is stale).
    ///
    /// A restored engine is never running: resuming needs an explicit `start`.
    pub fn restore(settings: Arc<TimerSettings>, clock: SharedClock, snapshots: Snapshots) -> Self {
        let mut engine = Self::new(settings, clock, snapshots);
        if let Some(snapshot) = engine.snapshots.load() {
            engine.apply_snapshot(&snapshot);
        }
        engine
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    fn apply_snapshot(&mut self, snapshot: &TimerSnapshot) {
        let full = self.settings.duration_secs(snapshot.mode);
        self.mode = snapshot.mode;
        self.remaining_secs = snapshot.time_remaining_seconds.min(full);
        self.is_running = false;
        self.target_end = None;
        self.session_start_time = snapshot.session_start_time;
        self.current_session_index = snapshot.current_session_index;
        self.last_recorded_full_minutes = snapshot.last_recorded_full_minutes;
        if snapshot.is_running {
            info!(
                mode = %self.mode,
                remaining = self.remaining_secs,
                "restored a running timer as paused"
            );
        } else {
            debug!(mode = %self.mode, remaining = self.remaining_secs, "timer restored");
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Remaining seconds as of now.
    pub fn remaining_secs(&self) -> u32 {
        match (self.is_running, self.target_end) {
            (true, Some(end)) => remaining_until(end, self.clock.now()),
            _ => self.remaining_secs,
        }
    }

    pub fn current_session_index(&self) -> u32 {
        self.current_session_index
    }

    pub fn session_start_time(&self) -> Option<DateTime<Utc>> {
        self.session_start_time
    }

    pub fn last_recorded_full_minutes(&self) -> u32 {
        self.last_recorded_full_minutes
    }

    pub fn settings(&self) -> &Arc<TimerSettings> {
        &self.settings
    }

    pub fn has_pending_settings(&self) -> bool {
        self.pending_settings.is_some()
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    /// Full length of the current mode in seconds.
    pub fn total_secs(&self) -> u32 {
        self.settings.duration_secs(self.mode)
    }

    /// 0.0 .. 100.0 progress within the current interval.
    pub fn progress_percent(&self) -> f64 {
        let total = self.total_secs();
        if total == 0 {
            return 0.0;
        }
        let remaining = self.remaining_secs().min(total);
        f64::from(total - remaining) / f64::from(total) * 100.0
    }

    pub fn view(&self) -> TimerView {
        TimerView {
            mode: self.mode,
            is_running: self.is_running,
            time_remaining_seconds: self.remaining_secs(),
            progress_percent: self.progress_percent(),
        }
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            version: SNAPSHOT_VERSION,
            mode: self.mode,
            time_remaining_seconds: self.remaining_secs(),
            is_running: self.is_running,
            session_start_time: self.session_start_time,
            current_session_index: self.current_session_index,
            last_recorded_full_minutes: self.last_recorded_full_minutes,
            saved_at: self.clock.now(),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn start(&mut self) -> Option<Event> {
        if self.is_running {
            return None;
        }
        let now = self.clock.now();
        self.is_running = true;
        self.target_end = Some(now + Duration::seconds(i64::from(self.remaining_secs)));
        let session_started_at = *self.session_start_time.get_or_insert(now);
        self.run_id = self.run_id.wrapping_add(1);
        info!(mode = %self.mode, remaining = self.remaining_secs, "timer started");
        self.persist();
        Some(Event::TimerStarted {
            mode: self.mode,
            remaining_secs: self.remaining_secs,
            session_started_at,
            at: now,
        })
    }

    /// Stop the countdown, keeping the remaining time. A second call is a no-op.
    pub fn pause(&mut self) -> Option<Event> {
        if !self.is_running {
            return None;
        }
        let now = self.clock.now();
        self.halt(now);
        info!(mode = %self.mode, remaining = self.remaining_secs, "timer paused");
        self.persist();
        Some(Event::TimerPaused {
            mode: self.mode,
            remaining_secs: self.remaining_secs,
            at: now,
        })
    }

    pub fn reset(&mut self) -> Event {
        let now = self.clock.now();
        self.halt(now);
        self.apply_pending_settings();
        self.remaining_secs = self.total_secs();
        self.session_start_time = None;
        self.last_recorded_full_minutes = 0;
        info!(mode = %self.mode, "timer reset");
        self.persist();
        Event::TimerReset {
            mode: self.mode,
            remaining_secs: self.remaining_secs,
            at: now,
        }
    }

    pub fn change_mode(&mut self, mode: TimerMode) -> Event {
        let now = self.clock.now();
        let from = self.mode;
        self.halt(now);
        self.apply_pending_settings();
        if mode.is_work() && !from.is_work() {
            self.current_session_index = 0;
        }
        self.mode = mode;
        self.remaining_secs = self.total_secs();
        self.session_start_time = None;
        self.last_recorded_full_minutes = 0;
        info!(%from, to = %mode, "timer mode changed");
        self.persist();
        Event::ModeChanged {
            from,
            to: mode,
            remaining_secs: self.remaining_secs,
            session_index: self.current_session_index,
            at: now,
        }
    }

    /// Replace the settings value.
    ///
    /// When stopped, the current interval is resized right away. When running,
    /// the new value waits for the next reset, mode change or completion so the
    /// interval in progress is not truncated.
    pub fn update_settings(&mut self, settings: TimerSettings) -> Event {
        let now = self.clock.now();
        let settings = Arc::new(settings);
        let applied = !self.is_running;
        if applied {
            self.settings = settings;
            self.pending_settings = None;
            self.remaining_secs = self.total_secs();
            self.session_start_time = None;
            self.last_recorded_full_minutes = 0;
            self.persist();
        } else {
            self.pending_settings = Some(settings);
        }
        info!(applied, "timer settings updated");
        Event::SettingsChanged {
            applied,
            remaining_secs: self.remaining_secs(),
            at: now,
        }
    }

    /// Recompute from the wall clock. Call periodically while running.
    pub fn tick(&mut self) -> Vec<Event> {
        let (true, Some(end)) = (self.is_running, self.target_end) else {
            return Vec::new();
        };
        let now = self.clock.now();
        self.remaining_secs = remaining_until(end, now);

        let mut events = vec![Event::Tick {
            mode: self.mode,
            remaining_secs: self.remaining_secs,
            at: now,
        }];

        if self.remaining_secs == 0 {
            events.extend(self.complete(now));
            return events;
        }

        if let Some(event) = self.minute_boundary(now) {
            events.push(event);
        }
        events
    }

    /// Snapshot to write if the periodic save interval has elapsed.
    ///
    /// Marks the snapshot as saved; the caller owns the actual write.
    pub fn periodic_snapshot(&mut self) -> Option<PendingSnapshot> {
        if !self.is_running {
            return None;
        }
        let now = self.clock.now();
        let due = self
            .last_saved_at
            .map_or(true, |last| now - last >= self.save_interval);
        if !due {
            return None;
        }
        self.last_saved_at = Some(now);
        Some(PendingSnapshot {
            ticket: self.snapshots.ticket(),
            snapshot: self.snapshot(),
        })
    }

    /// Write the periodic snapshot inline if it is due.
    pub fn persist_if_due(&mut self) {
        if let Some(pending) = self.periodic_snapshot() {
            if let Err(e) = self.snapshots.save_pending(&pending) {
                warn!("periodic timer snapshot failed: {e}");
            }
        }
    }

    /// Best-effort synchronous save for process shutdown.
    pub fn save_for_shutdown(&mut self) {
        let snapshot = self.snapshot();
        self.last_saved_at = Some(snapshot.saved_at);
        if let Err(e) = self.snapshots.save_blocking(&snapshot) {
            tracing::error!("timer snapshot on shutdown failed: {e}");
        }
    }

    /// Drop any persisted snapshot without touching live state.
    pub fn discard_saved_state(&self) {
        if let Err(e) = self.snapshots.clear() {
            warn!("failed to clear timer snapshot: {e}");
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn halt(&mut self, now: DateTime<Utc>) {
        if let (true, Some(end)) = (self.is_running, self.target_end) {
            self.remaining_secs = remaining_until(end, now);
        }
        self.is_running = false;
        self.target_end = None;
    }

    fn minute_boundary(&mut self, now: DateTime<Utc>) -> Option<Event> {
        if !self.mode.is_work() {
            return None;
        }
        let session_started_at = self.session_start_time?;
        let elapsed_secs = self.total_secs().saturating_sub(self.remaining_secs);
        let full_minutes = elapsed_secs / 60;
        if full_minutes <= self.last_recorded_full_minutes {
            return None;
        }
        self.last_recorded_full_minutes = full_minutes;
        debug!(full_minutes, "work minute boundary");
        Some(Event::MinuteElapsed {
            session_started_at,
            full_minutes,
            elapsed_secs,
            at: now,
        })
    }

    fn complete(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let completed = self.mode;
        let duration_secs = self.total_secs();
        let session_started_at = self.session_start_time.take();
        self.halt(now);

        if completed.is_work() {
            self.current_session_index = self.current_session_index.saturating_add(1);
        }
        let session_index = self.current_session_index;

        self.apply_pending_settings();
        let next = completed.after_completion(session_index, self.settings.sessions_until_long_break());
        self.mode = next;
        self.remaining_secs = self.total_secs();
        self.last_recorded_full_minutes = 0;

        info!(%completed, %next, session_index, "timer interval completed");
        self.persist();

        vec![
            Event::TimerCompleted {
                mode: completed,
                duration_secs,
                session_started_at,
                session_index,
                at: now,
            },
            Event::ModeChanged {
                from: completed,
                to: next,
                remaining_secs: self.remaining_secs,
                session_index,
                at: now,
            },
        ]
    }

    fn apply_pending_settings(&mut self) {
        if let Some(settings) = self.pending_settings.take() {
            debug!("applying deferred timer settings");
            self.settings = settings;
        }
    }

    fn persist(&mut self) {
        let snapshot = self.snapshot();
        self.last_saved_at = Some(snapshot.saved_at);
        if let Err(e) = self.snapshots.save(&snapshot) {
            warn!("timer snapshot write failed: {e}");
        }
    }
}

/// `ceil((end - now) / 1s)`, floored at zero.
fn remaining_until(end: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let ms = (end - now).num_milliseconds();
    if ms <= 0 {
        return 0;
    }
    u32::try_from((ms + 999) / 1000).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::persistence::{MemorySnapshotStore, PersistenceStore};

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemorySnapshotStore>,
        engine: TimerEngine,
    }

    fn fixture_with(settings: TimerSettings) -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(MemorySnapshotStore::new());
        let snapshots = Snapshots::new(store.clone(), Arc::new(clock.clone()));
        let engine = TimerEngine::new(Arc::new(settings), Arc::new(clock.clone()), snapshots);
        Fixture {
            clock,
            store,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TimerSettings::default())
    }

    fn completions(events: &[Event]) -> usize {
        events.iter().filter(|e| e.is_completion()).count()
    }

    #[test]
    fn start_pause_start() {
        let mut f = fixture();
        assert!(!f.engine.is_running());
        assert!(f.engine.start().is_some());
        assert!(f.engine.is_running());
        assert!(f.engine.start().is_none(), "start requires a stopped timer");
        assert!(f.engine.pause().is_some());
        assert!(!f.engine.is_running());
        assert!(f.engine.start().is_some());
    }

    #[test]
    fn second_pause_writes_nothing() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(3);
        assert!(f.engine.pause().is_some());
        let writes = f.store.write_count();
        let remaining = f.engine.remaining_secs();

        assert!(f.engine.pause().is_none());
        assert_eq!(f.store.write_count(), writes);
        assert_eq!(f.engine.remaining_secs(), remaining);
    }

    #[test]
    fn remaining_follows_wall_clock_not_tick_count() {
        let mut f = fixture();
        f.engine.start();
        assert_eq!(f.engine.remaining_secs(), 1500);

        // No ticks at all for 5 seconds.
        f.clock.advance_secs(5);
        f.engine.tick();
        assert_eq!(f.engine.remaining_secs(), 1495);

        // Many ticks over another 5 seconds.
        for _ in 0..50 {
            f.clock.advance_ms(100);
            f.engine.tick();
        }
        assert_eq!(f.engine.remaining_secs(), 1490);
    }

    #[test]
    fn partial_seconds_round_up() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_ms(400);
        f.engine.tick();
        assert_eq!(f.engine.remaining_secs(), 1500);
        f.clock.advance_ms(600);
        f.engine.tick();
        assert_eq!(f.engine.remaining_secs(), 1499);
    }

    #[test]
    fn start_marks_session_start_once() {
        let mut f = fixture();
        let t0 = f.clock.now();
        f.engine.start();
        f.clock.advance_secs(10);
        f.engine.pause();
        f.clock.advance_secs(10);
        f.engine.start();
        assert_eq!(f.engine.session_start_time(), Some(t0));
    }

    #[test]
    fn reset_restores_full_duration_and_clears_session() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(100);
        f.engine.reset();
        assert!(!f.engine.is_running());
        assert_eq!(f.engine.remaining_secs(), 1500);
        assert!(f.engine.session_start_time().is_none());
    }

    #[test]
    fn four_work_completions_cycle_to_long_break() {
        let mut f = fixture();
        let mut after_work = Vec::new();
        for _ in 0..4 {
            assert_eq!(f.engine.mode(), TimerMode::Work);
            f.engine.start();
            f.clock.advance_secs(1500);
            let events = f.engine.tick();
            assert_eq!(completions(&events), 1);
            after_work.push(f.engine.mode());

            // Run the break through so the next interval is Work again.
            f.engine.start();
            f.clock.advance_secs(i64::from(f.engine.total_secs()));
            assert_eq!(completions(&f.engine.tick()), 1);
        }
        assert_eq!(
            after_work,
            vec![
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::LongBreak
            ]
        );
    }

    #[test]
    fn completion_fires_once_and_stops() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(2000);
        let first = f.engine.tick();
        assert_eq!(completions(&first), 1);
        assert!(!f.engine.is_running());
        assert_eq!(f.engine.mode(), TimerMode::Break);
        assert_eq!(f.engine.remaining_secs(), 300);

        f.clock.advance_secs(10);
        assert!(f.engine.tick().is_empty());
    }

    #[test]
    fn entering_work_from_break_resets_session_index() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(1500);
        f.engine.tick();
        assert_eq!(f.engine.current_session_index(), 1);

        f.engine.change_mode(TimerMode::Work);
        assert_eq!(f.engine.current_session_index(), 0);
        assert_eq!(f.engine.remaining_secs(), 1500);
    }

    #[test]
    fn work_to_work_keeps_session_index() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(1500);
        f.engine.tick();
        f.engine.start();
        f.clock.advance_secs(300);
        f.engine.tick();
        assert_eq!(f.engine.mode(), TimerMode::Work);

        f.engine.change_mode(TimerMode::Work);
        assert_eq!(f.engine.current_session_index(), 1);
    }

    #[test]
    fn change_mode_stops_running_timer() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(30);
        let event = f.engine.change_mode(TimerMode::LongBreak);
        assert!(matches!(event, Event::ModeChanged { to: TimerMode::LongBreak, .. }));
        assert!(!f.engine.is_running());
        assert_eq!(f.engine.remaining_secs(), 900);
    }

    #[test]
    fn settings_resize_immediately_when_stopped() {
        let mut f = fixture();
        let event = f.engine.update_settings(TimerSettings::new(50, 10, 20, 4).unwrap());
        assert!(matches!(event, Event::SettingsChanged { applied: true, .. }));
        assert_eq!(f.engine.remaining_secs(), 3000);
    }

    #[test]
    fn settings_deferred_while_running() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(60);
        let event = f.engine.update_settings(TimerSettings::new(50, 10, 20, 4).unwrap());
        assert!(matches!(event, Event::SettingsChanged { applied: false, .. }));
        assert!(f.engine.has_pending_settings());

        f.engine.tick();
        assert_eq!(f.engine.remaining_secs(), 1440, "running interval not truncated");

        f.engine.reset();
        assert_eq!(f.engine.remaining_secs(), 3000);
        assert!(!f.engine.has_pending_settings());
    }

    #[test]
    fn minute_boundaries_fire_once_each() {
        let mut f = fixture();
        f.engine.start();
        let mut minutes = Vec::new();
        for _ in 0..(3 * 60 * 4) {
            f.clock.advance_ms(250);
            for event in f.engine.tick() {
                if let Event::MinuteElapsed { full_minutes, .. } = event {
                    minutes.push(full_minutes);
                }
            }
        }
        assert_eq!(minutes, vec![1, 2, 3]);
    }

    #[test]
    fn minute_boundary_skips_ahead_after_long_gap() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(5 * 60 + 2);
        let events = f.engine.tick();
        let minutes: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::MinuteElapsed { full_minutes, .. } => Some(*full_minutes),
                _ => None,
            })
            .collect();
        assert_eq!(minutes, vec![5]);
    }

    #[test]
    fn break_intervals_do_not_emit_minutes() {
        let mut f = fixture();
        f.engine.change_mode(TimerMode::Break);
        f.engine.start();
        f.clock.advance_secs(120);
        assert!(!f
            .engine
            .tick()
            .iter()
            .any(|e| matches!(e, Event::MinuteElapsed { .. })));
    }

    #[test]
    fn periodic_snapshot_respects_interval() {
        let mut f = fixture();
        f.engine.start();
        assert!(f.engine.periodic_snapshot().is_none(), "start just saved");
        f.clock.advance_secs(4);
        assert!(f.engine.periodic_snapshot().is_none());
        f.clock.advance_secs(1);
        let snap = f.engine.periodic_snapshot().expect("due").snapshot;
        assert!(snap.is_running);
        assert_eq!(snap.time_remaining_seconds, 1495);
    }

    #[test]
    fn restore_never_resumes_running() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(100);
        f.engine.persist_if_due();
        assert!(f.store.load().unwrap().unwrap().is_running);

        let snapshots = Snapshots::new(f.store.clone(), Arc::new(f.clock.clone()));
        let restored = TimerEngine::restore(
            Arc::new(TimerSettings::default()),
            Arc::new(f.clock.clone()),
            snapshots,
        );
        assert!(!restored.is_running());
        assert_eq!(restored.remaining_secs(), 1400);
        assert_eq!(restored.session_start_time(), f.engine.session_start_time());
    }

    #[test]
    fn view_reports_progress() {
        let mut f = fixture();
        f.engine.start();
        f.clock.advance_secs(375);
        let view = f.engine.view();
        assert!(view.is_running);
        assert_eq!(view.time_remaining_seconds, 1125);
        assert!((view.progress_percent - 25.0).abs() < f64::EPSILON);
    }
}
