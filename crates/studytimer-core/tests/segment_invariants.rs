//! Property tests for the segment ledger.
//!
//! For any interleaving of start/switch/pause/resume/stop, process restarts
//! and clock advances:
//! - at most one segment is open at a time
//! - a closed session's total equals the sum of its segment durations
//! - that sum matches the session's wall-clock span minus paused time,
//!   within one second per segment

use std::sync::Arc;

use proptest::prelude::*;
use studytimer_core::{
    ManualClock, MemoryStore, RemoteStore, TopicSegmentTracker, TrackerState,
    TrackingMode,
};

const TOPICS: [&str; 3] = ["algebra", "physics", "history"];

#[derive(Debug, Clone)]
enum Op {
    Start(usize),
    Switch(usize),
    Pause,
    Resume,
    Stop,
    /// The process goes away and a new tracker recovers from the store.
    Restart,
    Advance(i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..TOPICS.len()).prop_map(Op::Start),
        (0..TOPICS.len()).prop_map(Op::Switch),
        Just(Op::Pause),
        Just(Op::Resume),
        Just(Op::Stop),
        Just(Op::Restart),
        (0i64..120_000).prop_map(Op::Advance),
        (0i64..2_000).prop_map(Op::Advance),
    ]
}

fn open_segments(store: &MemoryStore) -> usize {
    store.all_segments().iter().filter(|s| s.is_open()).count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn segment_ledger_invariants(ops in prop::collection::vec(arb_op(), 1..60)) {
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let mut tracker = TopicSegmentTracker::new("u1", Arc::new(clock.clone()));
        // Time spent with the session open but no segment, in ms.
        let mut paused_ms = 0i64;

        for op in ops {
            let writes = match op {
                Op::Start(t) => tracker.start_timer(TOPICS[t], TrackingMode::FreeStudy),
                Op::Switch(t) => tracker.switch_topic(TOPICS[t]),
                Op::Pause => tracker.pause_timer(),
                Op::Resume => tracker.resume_timer(),
                Op::Stop => {
                    let session_id = tracker.session().map(|s| s.id.clone());
                    let writes = tracker.stop_timer();
                    tracker.commit(&store, writes);
                    if let Some(id) = session_id {
                        let session = store.session(&id).unwrap().unwrap();
                        let segments = store.segments_for_session(&id).unwrap();
                        let sum: u32 = segments.iter().map(|s| s.duration_seconds).sum();
                        prop_assert_eq!(session.total_seconds, sum);

                        let ended = session.ended_at.unwrap();
                        let span_ms = (ended - session.started_at).num_milliseconds() - paused_ms;
                        let sum_ms = i64::from(sum) * 1000;
                        let n = segments.len() as i64;
                        prop_assert!(sum_ms <= span_ms, "sum {} > span {}", sum_ms, span_ms);
                        prop_assert!(span_ms - sum_ms <= n * 1000, "span {} vs sum {} over {} segments", span_ms, sum_ms, n);
                    }
                    paused_ms = 0;
                    Vec::new()
                }
                Op::Restart => {
                    tracker = TopicSegmentTracker::new("u1", Arc::new(clock.clone()));
                    tracker.recover(&store).unwrap();
                    Vec::new()
                }
                Op::Advance(ms) => {
                    if tracker.state() == TrackerState::SessionOpen {
                        paused_ms += ms;
                    }
                    clock.advance_ms(ms);
                    Vec::new()
                }
            };
            tracker.commit(&store, writes);

            let open = open_segments(&store);
            prop_assert!(open <= 1, "{} open segments", open);
            let expected = usize::from(tracker.state() == TrackerState::SegmentOpen);
            prop_assert_eq!(open, expected);
        }
    }

    #[test]
    fn failed_writes_never_open_a_second_segment(
        ops in prop::collection::vec((0..TOPICS.len(), any::<bool>(), 0i64..30_000), 1..40)
    ) {
        let clock = ManualClock::default();
        let store = MemoryStore::new();
        let mut tracker = TopicSegmentTracker::new("u1", Arc::new(clock.clone()));
        let w = tracker.start_timer(TOPICS[0], TrackingMode::FreeStudy);
        tracker.commit(&store, w);

        for (topic, fail, ms) in ops {
            store.fail_writes(fail);
            clock.advance_ms(ms);
            let w = tracker.switch_topic(TOPICS[topic]);
            tracker.commit(&store, w);
            store.fail_writes(false);
            tracker.outbox().retry(&store);
            prop_assert!(open_segments(&store) <= 1);
        }
    }
}
