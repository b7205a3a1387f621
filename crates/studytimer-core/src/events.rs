use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timer::TimerMode;

/// Every state change of the timer engine produces an Event.
/// The UI renders from them; the session recorder and the topic tracker
/// subscribe to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TimerStarted {
        mode: TimerMode,
        remaining_secs: u32,
        session_started_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    TimerPaused {
        mode: TimerMode,
        remaining_secs: u32,
        at: DateTime<Utc>,
    },
    TimerReset {
        mode: TimerMode,
        remaining_secs: u32,
        at: DateTime<Utc>,
    },
    ModeChanged {
        from: TimerMode,
        to: TimerMode,
        remaining_secs: u32,
        session_index: u32,
        at: DateTime<Utc>,
    },
    /// Emitted on every tick while running.
    Tick {
        mode: TimerMode,
        remaining_secs: u32,
        at: DateTime<Utc>,
    },
    /// A running Work interval crossed a whole-minute boundary.
    MinuteElapsed {
        session_started_at: DateTime<Utc>,
        full_minutes: u32,
        elapsed_secs: u32,
        at: DateTime<Utc>,
    },
    /// Fired exactly once per interval that counts down to zero.
    TimerCompleted {
        mode: TimerMode,
        duration_secs: u32,
        session_started_at: Option<DateTime<Utc>>,
        session_index: u32,
        at: DateTime<Utc>,
    },
    SettingsChanged {
        /// `false` when the change is parked until the next reset or mode change.
        applied: bool,
        remaining_secs: u32,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::TimerStarted { at, .. }
            | Event::TimerPaused { at, .. }
            | Event::TimerReset { at, .. }
            | Event::ModeChanged { at, .. }
            | Event::Tick { at, .. }
            | Event::MinuteElapsed { at, .. }
            | Event::TimerCompleted { at, .. }
            | Event::SettingsChanged { at, .. } => *at,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, Event::TimerCompleted { .. })
    }
}
