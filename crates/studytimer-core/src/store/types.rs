//! Records kept in the remote store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::elapsed_secs;
use crate::error::ValidationError;
use crate::timer::TimerMode;

/// How a tracking session relates to the countdown timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Segments follow the timer: they open when a Work interval runs and
    /// close when it pauses, stops or completes.
    #[default]
    Pomodoro,
    /// Segments follow only the explicit tracking controls.
    FreeStudy,
}

impl TrackingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackingMode::Pomodoro => "pomodoro",
            TrackingMode::FreeStudy => "free_study",
        }
    }
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pomodoro" => Ok(TrackingMode::Pomodoro),
            "free_study" | "freestudy" => Ok(TrackingMode::FreeStudy),
            other => Err(ValidationError::InvalidValue {
                field: "tracking_mode".into(),
                message: format!("unknown tracking mode '{other}'"),
            }),
        }
    }
}

/// A tracking episode bounded by explicit start and stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub mode: TrackingMode,
    pub total_seconds: u32,
}

impl TimerSession {
    pub fn open(user_id: &str, mode: TrackingMode, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            started_at,
            ended_at: None,
            mode,
            total_seconds: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A contiguous span of time attributed to one topic within one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicTimeSegment {
    pub id: String,
    pub timer_session_id: String,
    pub topic_id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Final once closed; while open, the last synced elapsed value.
    pub duration_seconds: u32,
}

impl TopicTimeSegment {
    pub fn open(session: &TimerSession, topic_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timer_session_id: session.id.clone(),
            topic_id: topic_id.to_string(),
            user_id: session.user_id.clone(),
            started_at,
            ended_at: None,
            duration_seconds: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Close at `now`; duration is the whole seconds since `started_at`.
    pub fn close(&mut self, now: DateTime<Utc>) {
        self.duration_seconds = elapsed_secs(self.started_at, now);
        self.ended_at = Some(now);
    }

    /// Close with an explicit duration, ending at `started_at + duration`.
    pub fn close_with_duration(&mut self, duration_seconds: u32) {
        self.duration_seconds = duration_seconds;
        self.ended_at = Some(self.started_at + chrono::Duration::seconds(i64::from(duration_seconds)));
    }
}

/// Per-interval focus record written by the session recorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Derived from user and interval start so repeated writes upsert.
    pub id: String,
    pub user_id: String,
    pub mode: TimerMode,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u32,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn key(user_id: &str, started_at: DateTime<Utc>) -> String {
        format!("{user_id}:{}", started_at.timestamp_millis())
    }
}
