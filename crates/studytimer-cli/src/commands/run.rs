use std::sync::Arc;

use clap::Args;
use studytimer_core::{
    Event, Recovery, ServiceOptions, TimerMode, TimerService, TrackerState, TrackingMode,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::{CmdResult, Context};

#[derive(Args)]
pub struct RunArgs {
    /// Track time against this topic while the timer runs
    #[arg(long)]
    topic: Option<String>,
    /// Interval to run (work, break, long-break); defaults to the saved one
    #[arg(long)]
    mode: Option<TimerMode>,
    /// Track the topic explicitly instead of following work intervals
    #[arg(long)]
    free_study: bool,
    /// Also print tick events
    #[arg(long)]
    ticks: bool,
}

/// Drive one interval in the foreground, printing events as JSON lines.
///
/// Stops after the interval completes or on Ctrl-C. Either way the engine
/// is saved paused and the open segment closed; the tracking session stays
/// open for the next run.
pub async fn run(args: RunArgs) -> CmdResult {
    let ctx = Context::open()?;
    let service = TimerService::new(
        Arc::new(ctx.config.timer.clone()),
        ctx.clock.clone(),
        ctx.snapshots(),
        ctx.store.clone(),
        ServiceOptions::from_config(&ctx.config),
    );
    ctx.load_outbox(&service.outbox())?;

    match service.startup()? {
        Recovery::Nothing => {}
        Recovery::Session { session_id, pending_topic } => {
            info!(session = %session_id, topic = ?pending_topic, "continuing tracking session");
        }
        Recovery::Segment { session_id, topic_id, started_at } => {
            info!(session = %session_id, topic = %topic_id, %started_at, "continuing open segment");
        }
    }

    if let Some(mode) = args.mode {
        if mode != service.mode() {
            service.change_mode(mode);
        }
    }
    if let Some(topic) = &args.topic {
        if service.tracker_state() == TrackerState::Idle {
            let tracking = if args.free_study {
                TrackingMode::FreeStudy
            } else {
                ctx.config.tracking.default_mode
            };
            service.start_tracking(topic, tracking);
        } else {
            service.switch_topic(topic);
        }
    }

    let mut events = service.subscribe();
    service.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut completed = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, saving state");
                break;
            }
            msg = events.recv() => match msg {
                Ok(event) => {
                    if matches!(event, Event::Tick { .. }) && !args.ticks {
                        continue;
                    }
                    println!("{}", serde_json::to_string(&event)?);
                    match event {
                        Event::TimerCompleted { .. } => completed = true,
                        // The mode change that follows a completion ends the run.
                        Event::ModeChanged { .. } if completed => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    service.shutdown().await;
    ctx.save_outbox(&service.outbox())?;
    Ok(())
}
