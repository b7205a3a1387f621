use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The interval type currently being timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    #[default]
    Work,
    Break,
    LongBreak,
}

impl TimerMode {
    pub fn is_work(self) -> bool {
        self == TimerMode::Work
    }

    /// Mode entered after an interval of `self` completes.
    ///
    /// `completed_work_sessions` is the count including the one that just
    /// finished; every `sessions_until_long_break`-th Work session earns a
    /// long break.
    pub fn after_completion(self, completed_work_sessions: u32, sessions_until_long_break: u32) -> Self {
        match self {
            TimerMode::Work => {
                if sessions_until_long_break > 0
                    && completed_work_sessions > 0
                    && completed_work_sessions % sessions_until_long_break == 0
                {
                    TimerMode::LongBreak
                } else {
                    TimerMode::Break
                }
            }
            TimerMode::Break | TimerMode::LongBreak => TimerMode::Work,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimerMode::Work => "work",
            TimerMode::Break => "break",
            TimerMode::LongBreak => "long_break",
        }
    }
}

impl fmt::Display for TimerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "work" | "focus" => Ok(TimerMode::Work),
            "break" | "short_break" => Ok(TimerMode::Break),
            "long_break" | "longbreak" => Ok(TimerMode::LongBreak),
            other => Err(ValidationError::InvalidValue {
                field: "mode".into(),
                message: format!("unknown timer mode '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_fourth_work_session_earns_long_break() {
        let seq: Vec<_> = (1..=8)
            .map(|n| TimerMode::Work.after_completion(n, 4))
            .collect();
        assert_eq!(
            seq,
            vec![
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::LongBreak,
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::Break,
                TimerMode::LongBreak,
            ]
        );
    }

    #[test]
    fn breaks_return_to_work() {
        assert_eq!(TimerMode::Break.after_completion(3, 4), TimerMode::Work);
        assert_eq!(TimerMode::LongBreak.after_completion(4, 4), TimerMode::Work);
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("long-break".parse::<TimerMode>().unwrap(), TimerMode::LongBreak);
        assert_eq!("Work".parse::<TimerMode>().unwrap(), TimerMode::Work);
        assert!("nap".parse::<TimerMode>().is_err());
    }
}
