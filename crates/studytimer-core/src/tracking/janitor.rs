//! Out-of-band cleanup of segments left open by a crash.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::JanitorConfig;
use crate::error::StoreError;
use crate::store::{RemoteStore, TimerSession, TopicTimeSegment};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSegment {
    pub segment_id: String,
    pub session_id: String,
    pub user_id: String,
    pub topic_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JanitorReport {
    pub dry_run: bool,
    pub closed_segments: Vec<ClosedSegment>,
    pub closed_sessions: Vec<String>,
    /// Writes that failed; the rows stay open for the next pass.
    pub failed_writes: usize,
}

pub struct Janitor {
    max_open: Duration,
    max_segment_secs: u32,
}

impl Janitor {
    pub fn new(config: &JanitorConfig) -> Self {
        Self {
            max_open: Duration::hours(i64::from(config.max_open_hours)),
            max_segment_secs: config.max_segment_minutes.saturating_mul(60),
        }
    }

    /// Duration given to an orphaned segment: its last synced value, capped.
    fn capped_duration(&self, segment: &TopicTimeSegment) -> u32 {
        match segment.duration_seconds {
            0 => self.max_segment_secs,
            synced => synced.min(self.max_segment_secs),
        }
    }

    /// Close segments open longer than the limit, then the sessions they
    /// leave without an open segment.
    pub fn run(
        &self,
        store: &dyn RemoteStore,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<JanitorReport, StoreError> {
        let mut report = JanitorReport {
            dry_run,
            ..JanitorReport::default()
        };
        let mut touched: BTreeMap<String, Vec<TopicTimeSegment>> = BTreeMap::new();

        for mut segment in store.open_segments()? {
            if now - segment.started_at <= self.max_open {
                continue;
            }
            let duration = self.capped_duration(&segment);
            segment.close_with_duration(duration);
            warn!(segment = %segment.id, topic = %segment.topic_id, duration, "closing orphaned segment");

            if !dry_run {
                if let Err(e) = store.upsert_segment(&segment) {
                    warn!(segment = %segment.id, "orphaned segment close failed: {e}");
                    report.failed_writes += 1;
                    continue;
                }
            }
            report.closed_segments.push(ClosedSegment {
                segment_id: segment.id.clone(),
                session_id: segment.timer_session_id.clone(),
                user_id: segment.user_id.clone(),
                topic_id: segment.topic_id.clone(),
                started_at: segment.started_at,
                duration_seconds: duration,
            });
            touched
                .entry(segment.timer_session_id.clone())
                .or_default()
                .push(segment);
        }

        for (session_id, closed_now) in touched {
            let Some(session) = store.session(&session_id)? else {
                continue;
            };
            if !session.is_open() {
                continue;
            }
            // In a dry run the store still shows the segments as open.
            let segments: Vec<TopicTimeSegment> = store
                .segments_for_session(&session_id)?
                .into_iter()
                .map(|s| closed_now.iter().find(|c| c.id == s.id).cloned().unwrap_or(s))
                .collect();
            if segments.iter().any(TopicTimeSegment::is_open) {
                continue;
            }
            let closed = close_session(session, &segments);
            if !dry_run {
                if let Err(e) = store.upsert_session(&closed) {
                    warn!(session = %closed.id, "orphaned session close failed: {e}");
                    report.failed_writes += 1;
                    continue;
                }
            }
            report.closed_sessions.push(closed.id);
        }

        info!(
            segments = report.closed_segments.len(),
            sessions = report.closed_sessions.len(),
            dry_run,
            "janitor pass finished"
        );
        Ok(report)
    }
}

fn close_session(mut session: TimerSession, segments: &[TopicTimeSegment]) -> TimerSession {
    let total: u64 = segments.iter().map(|s| u64::from(s.duration_seconds)).sum();
    session.total_seconds = u32::try_from(total).unwrap_or(u32::MAX);
    session.ended_at = segments
        .iter()
        .filter_map(|s| s.ended_at)
        .max()
        .or(Some(session.started_at));
    session
}
