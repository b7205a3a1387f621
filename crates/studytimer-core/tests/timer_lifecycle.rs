//! End-to-end timer behavior against the file snapshot backend.

use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;
use studytimer_core::{
    Event, FileSnapshotStore, ManualClock, MemorySnapshotStore, PersistenceStore,
    Snapshots, TimerEngine, TimerMode, TimerSettings,
};

fn engine_with(
    clock: &ManualClock,
    backend: Arc<dyn PersistenceStore>,
    settings: TimerSettings,
) -> TimerEngine {
    let snapshots = Snapshots::new(backend, Arc::new(clock.clone()));
    TimerEngine::restore(Arc::new(settings), Arc::new(clock.clone()), snapshots)
}

fn completions(events: &[Event]) -> usize {
    events.iter().filter(|e| e.is_completion()).count()
}

#[test]
fn pause_resume_complete_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileSnapshotStore::new(dir.path().join("timer.json")));
    let clock = ManualClock::default();
    let mut engine = engine_with(&clock, backend.clone(), TimerSettings::default());

    // T=0: start Work with 1500s.
    assert_eq!(engine.remaining_secs(), 1500);
    engine.start();

    // T=10: pause; 1490 is persisted.
    clock.advance_secs(10);
    engine.tick();
    engine.pause();
    let saved = backend.load().unwrap().unwrap();
    assert_eq!(saved.time_remaining_seconds, 1490);
    assert!(!saved.is_running);

    // Resume and run to the end with sparse ticks.
    engine.start();
    let mut events = Vec::new();
    for _ in 0..14 {
        clock.advance_secs(100);
        events.extend(engine.tick());
    }
    assert_eq!(engine.mode(), TimerMode::Work, "90s to go");
    // T=1500 from the resume point.
    clock.advance_secs(100);
    events.extend(engine.tick());
    // Extra ticks after completion do nothing.
    clock.advance_secs(5);
    events.extend(engine.tick());

    assert_eq!(completions(&events), 1);
    assert_eq!(engine.mode(), TimerMode::Break);
    assert_eq!(engine.remaining_secs(), 300);
    assert!(!engine.is_running());

    // A restart never resumes on its own.
    let restored = engine_with(&clock, backend, TimerSettings::default());
    assert!(!restored.is_running());
    assert_eq!(restored.mode(), TimerMode::Break);
    assert_eq!(restored.remaining_secs(), 300);
}

#[test]
fn four_work_sessions_earn_a_long_break() {
    let clock = ManualClock::default();
    let settings = TimerSettings::new(1, 1, 2, 4).unwrap();
    let mut engine = engine_with(&clock, Arc::new(MemorySnapshotStore::new()), settings);

    let mut breaks = Vec::new();
    for _ in 0..4 {
        assert_eq!(engine.mode(), TimerMode::Work);
        engine.start();
        clock.advance_secs(60);
        engine.tick();
        breaks.push(engine.mode());

        engine.start();
        clock.advance(Duration::minutes(2));
        engine.tick();
    }
    assert_eq!(
        breaks,
        vec![
            TimerMode::Break,
            TimerMode::Break,
            TimerMode::Break,
            TimerMode::LongBreak
        ]
    );
}

#[test]
fn restoration_boundary_is_thirty_minutes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timer.json");
    let clock = ManualClock::default();

    let mut engine = engine_with(
        &clock,
        Arc::new(FileSnapshotStore::new(&path)),
        TimerSettings::default(),
    );
    engine.start();
    clock.advance_secs(100);
    engine.pause();

    clock.advance(Duration::minutes(29));
    let fresh = engine_with(
        &clock,
        Arc::new(FileSnapshotStore::new(&path)),
        TimerSettings::default(),
    );
    assert_eq!(fresh.remaining_secs(), 1400);
    assert!(!fresh.is_running());

    clock.advance(Duration::minutes(2));
    let stale = engine_with(
        &clock,
        Arc::new(FileSnapshotStore::new(&path)),
        TimerSettings::default(),
    );
    assert_eq!(stale.remaining_secs(), 1500, "defaults after 31 minutes");
    assert!(!path.exists(), "stale snapshot is removed");
}

#[test]
fn settings_change_waits_for_running_interval() {
    let clock = ManualClock::default();
    let mut engine = engine_with(
        &clock,
        Arc::new(MemorySnapshotStore::new()),
        TimerSettings::default(),
    );
    engine.start();
    clock.advance_secs(60);
    engine.update_settings(TimerSettings::new(50, 10, 20, 4).unwrap());
    engine.tick();
    assert_eq!(engine.remaining_secs(), 1440, "interval in progress is untouched");

    engine.reset();
    assert_eq!(engine.remaining_secs(), 3000);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn remaining_tracks_wall_clock(steps in prop::collection::vec((0i64..20_000, any::<bool>()), 1..40)) {
        let clock = ManualClock::default();
        let mut engine = engine_with(
            &clock,
            Arc::new(MemorySnapshotStore::new()),
            TimerSettings::default(),
        );
        engine.start();
        let mut elapsed_ms = 0i64;
        for (ms, tick) in steps {
            clock.advance_ms(ms);
            elapsed_ms += ms;
            if tick {
                engine.tick();
            }
            if elapsed_ms >= 1_500_000 {
                break;
            }
            let expected = (1_500_000 - elapsed_ms + 999) / 1000;
            prop_assert_eq!(i64::from(engine.remaining_secs()), expected);
        }
    }
}
