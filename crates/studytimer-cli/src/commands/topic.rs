use clap::Subcommand;
use serde::Serialize;
use studytimer_core::{LiveSegment, TimerSession, TopicSegmentTracker, TrackerState, TrackingMode};
use tracing::warn;

use super::{print_json, CmdResult, Context};

#[derive(Subcommand)]
pub enum TopicAction {
    /// Open a tracking session on a topic
    Start {
        topic: String,
        /// Track explicitly instead of following the timer
        #[arg(long)]
        free_study: bool,
    },
    /// Move tracking to another topic
    Switch { topic: String },
    /// Close the open segment, keeping the session
    Pause,
    /// Reopen a segment on the last topic
    Resume,
    /// Close the session
    Stop,
    /// Seconds tracked on a topic, including the live segment
    Total { topic: String },
    /// Print the tracking state as JSON
    Status,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackingStatus<'a> {
    state: TrackerState,
    session: Option<&'a TimerSession>,
    live_segment: Option<LiveSegment>,
    pending_topic: Option<&'a str>,
    pending_writes: usize,
}

pub fn run(action: TopicAction) -> CmdResult {
    let ctx = Context::open()?;
    let store = ctx.store.as_ref();

    let mut tracker = TopicSegmentTracker::new(ctx.config.tracking.user_id.clone(), ctx.clock.clone());
    ctx.load_outbox(tracker.outbox())?;
    tracker.outbox().retry(store);
    tracker.recover(store)?;

    let writes = match action {
        TopicAction::Start { topic, free_study } => {
            let mode = if free_study {
                TrackingMode::FreeStudy
            } else {
                ctx.config.tracking.default_mode
            };
            tracker.start_timer(&topic, mode)
        }
        TopicAction::Switch { topic } => tracker.switch_topic(&topic),
        TopicAction::Pause => tracker.pause_timer(),
        TopicAction::Resume => tracker.resume_timer(),
        TopicAction::Stop => tracker.stop_timer(),
        TopicAction::Total { topic } => {
            let seconds = tracker.topic_total_seconds(store, &topic)?;
            ctx.save_outbox(tracker.outbox())?;
            return print_json(&serde_json::json!({ "topicId": topic, "totalSeconds": seconds }));
        }
        TopicAction::Status => Vec::new(),
    };

    let failed = tracker.commit(store, writes);
    if failed > 0 {
        warn!(failed, "some tracking writes were queued for retry");
    }
    ctx.save_outbox(tracker.outbox())?;

    print_json(&TrackingStatus {
        state: tracker.state(),
        session: tracker.session(),
        live_segment: tracker.live_view(),
        pending_topic: tracker.pending_topic(),
        pending_writes: tracker.outbox().len(),
    })
}
