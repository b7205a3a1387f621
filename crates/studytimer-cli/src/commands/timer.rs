use clap::Subcommand;
use studytimer_core::TimerMode;

use super::{print_json, CmdResult, Context};

#[derive(Subcommand)]
pub enum TimerAction {
    /// Print the saved timer state as JSON
    Status,
    /// Reset the current interval to its full length
    Reset {
        /// Also drop the saved snapshot
        #[arg(long)]
        forget: bool,
    },
    /// Switch to another interval type (work, break, long-break)
    Mode {
        mode: TimerMode,
    },
}

/// One-shot timer commands operate on the saved snapshot.
///
/// A restored engine is always paused; `studytimer run` is the only place
/// the countdown advances.
pub fn run(action: TimerAction) -> CmdResult {
    let ctx = Context::open()?;
    let mut engine = ctx.engine();

    match action {
        TimerAction::Status => {
            let status = serde_json::json!({
                "timer": engine.view(),
                "sessionIndex": engine.current_session_index(),
                "settings": engine.settings().as_ref(),
            });
            print_json(&status)?;
        }
        TimerAction::Reset { forget } => {
            let event = engine.reset();
            if forget {
                engine.discard_saved_state();
            }
            print_json(&event)?;
        }
        TimerAction::Mode { mode } => {
            print_json(&engine.change_mode(mode))?;
        }
    }
    Ok(())
}
