use serde::{Deserialize, Serialize};

use super::mode::TimerMode;
use crate::error::ValidationError;

/// Interval lengths and long-break cadence.
///
/// Always valid once constructed: every field is a positive integer.
/// The engine holds it behind an `Arc` and swaps in a new value on change,
/// so a reader never sees a half-updated configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimerSettings")]
pub struct TimerSettings {
    work_duration_minutes: u32,
    break_duration_minutes: u32,
    long_break_duration_minutes: u32,
    sessions_until_long_break: u32,
}

/// Unvalidated wire form; only reachable through `TryFrom`.
#[derive(Debug, Clone, Deserialize)]
struct RawTimerSettings {
    #[serde(default = "default_work")]
    work_duration_minutes: i64,
    #[serde(default = "default_break")]
    break_duration_minutes: i64,
    #[serde(default = "default_long_break")]
    long_break_duration_minutes: i64,
    #[serde(default = "default_sessions")]
    sessions_until_long_break: i64,
}

fn default_work() -> i64 {
    25
}
fn default_break() -> i64 {
    5
}
fn default_long_break() -> i64 {
    15
}
fn default_sessions() -> i64 {
    4
}

impl TryFrom<RawTimerSettings> for TimerSettings {
    type Error = ValidationError;

    fn try_from(raw: RawTimerSettings) -> Result<Self, Self::Error> {
        TimerSettings::new(
            raw.work_duration_minutes,
            raw.break_duration_minutes,
            raw.long_break_duration_minutes,
            raw.sessions_until_long_break,
        )
    }
}

fn positive(field: &'static str, value: i64) -> Result<u32, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositive { field });
    }
    u32::try_from(value).map_err(|_| ValidationError::InvalidValue {
        field: field.to_string(),
        message: format!("{value} is too large"),
    })
}

impl TimerSettings {
    /// Validate and build settings. Non-positive values are rejected.
    pub fn new(
        work_duration_minutes: i64,
        break_duration_minutes: i64,
        long_break_duration_minutes: i64,
        sessions_until_long_break: i64,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            work_duration_minutes: positive("work_duration_minutes", work_duration_minutes)?,
            break_duration_minutes: positive("break_duration_minutes", break_duration_minutes)?,
            long_break_duration_minutes: positive(
                "long_break_duration_minutes",
                long_break_duration_minutes,
            )?,
            sessions_until_long_break: positive(
                "sessions_until_long_break",
                sessions_until_long_break,
            )?,
        })
    }

    pub fn work_duration_minutes(&self) -> u32 {
        self.work_duration_minutes
    }

    pub fn break_duration_minutes(&self) -> u32 {
        self.break_duration_minutes
    }

    pub fn long_break_duration_minutes(&self) -> u32 {
        self.long_break_duration_minutes
    }

    pub fn sessions_until_long_break(&self) -> u32 {
        self.sessions_until_long_break
    }

    /// Configured length of `mode` in seconds.
    ///
    /// Uses saturating arithmetic so oversized minute values cannot overflow.
    pub fn duration_secs(&self, mode: TimerMode) -> u32 {
        let minutes = match mode {
            TimerMode::Work => self.work_duration_minutes,
            TimerMode::Break => self.break_duration_minutes,
            TimerMode::LongBreak => self.long_break_duration_minutes,
        };
        minutes.saturating_mul(60)
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            work_duration_minutes: 25,
            break_duration_minutes: 5,
            long_break_duration_minutes: 15,
            sessions_until_long_break: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_classic_pomodoro() {
        let s = TimerSettings::default();
        assert_eq!(s.duration_secs(TimerMode::Work), 1500);
        assert_eq!(s.duration_secs(TimerMode::Break), 300);
        assert_eq!(s.duration_secs(TimerMode::LongBreak), 900);
        assert_eq!(s.sessions_until_long_break(), 4);
    }

    #[test]
    fn rejects_zero_and_negative() {
        assert_eq!(
            TimerSettings::new(0, 5, 15, 4),
            Err(ValidationError::NonPositive {
                field: "work_duration_minutes"
            })
        );
        assert_eq!(
            TimerSettings::new(25, 5, 15, -1),
            Err(ValidationError::NonPositive {
                field: "sessions_until_long_break"
            })
        );
    }

    #[test]
    fn deserialization_validates() {
        let ok: TimerSettings =
            toml::from_str("work_duration_minutes = 50\nbreak_duration_minutes = 10").unwrap();
        assert_eq!(ok.work_duration_minutes(), 50);
        assert_eq!(ok.long_break_duration_minutes(), 15);

        let bad = toml::from_str::<TimerSettings>("break_duration_minutes = 0");
        assert!(bad.is_err());
    }
}
