//! Durable remote ledger of sessions, topic segments and focus records.
//!
//! The live core treats every [`StoreError`] as transient: it logs, keeps
//! its local state, and lets the next periodic write supersede the lost one.

mod memory;
pub mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{SessionRecord, TimerSession, TopicTimeSegment, TrackingMode};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Outbound port to the durable store.
///
/// Implementations must be safe to share between the tick task and the
/// control surface.
pub trait RemoteStore: Send + Sync {
    /// Insert or replace a session by id.
    fn upsert_session(&self, session: &TimerSession) -> Result<(), StoreError>;

    /// Insert or replace a segment by id.
    fn upsert_segment(&self, segment: &TopicTimeSegment) -> Result<(), StoreError>;

    /// The user's session with no `ended_at`, newest first if several.
    fn query_open_session(&self, user_id: &str) -> Result<Option<TimerSession>, StoreError>;

    /// The session's segment with no `ended_at`, newest first if several.
    fn query_open_segment(&self, session_id: &str) -> Result<Option<TopicTimeSegment>, StoreError>;

    /// Insert or replace a focus record by id.
    fn upsert_session_record(&self, record: &SessionRecord) -> Result<(), StoreError>;

    fn session(&self, session_id: &str) -> Result<Option<TimerSession>, StoreError>;

    /// All segments of a session ordered by `started_at`.
    fn segments_for_session(&self, session_id: &str) -> Result<Vec<TopicTimeSegment>, StoreError>;

    /// Sum of `duration_seconds` over the user's closed segments for a topic.
    fn closed_topic_seconds(&self, user_id: &str, topic_id: &str) -> Result<u64, StoreError>;

    /// Every open segment across users, oldest first.
    fn open_segments(&self) -> Result<Vec<TopicTimeSegment>, StoreError>;

    fn session_record(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;
}

/// One pending upsert against a [`RemoteStore`].
///
/// Components describe their writes as values so the caller decides where
/// they run (inline, or on a blocking worker off the tick path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum StoreWrite {
    Session(TimerSession),
    Segment(TopicTimeSegment),
    Record(SessionRecord),
}

impl StoreWrite {
    pub fn id(&self) -> &str {
        match self {
            StoreWrite::Session(s) => &s.id,
            StoreWrite::Segment(s) => &s.id,
            StoreWrite::Record(r) => &r.id,
        }
    }

    /// Writes that end a row's life. Losing one leaves the row open forever,
    /// so these are kept for retry instead of waiting to be superseded.
    pub fn is_closing(&self) -> bool {
        match self {
            StoreWrite::Session(s) => !s.is_open(),
            StoreWrite::Segment(s) => !s.is_open(),
            StoreWrite::Record(_) => false,
        }
    }

    pub fn apply(&self, store: &dyn RemoteStore) -> Result<(), StoreError> {
        match self {
            StoreWrite::Session(s) => store.upsert_session(s),
            StoreWrite::Segment(s) => store.upsert_segment(s),
            StoreWrite::Record(r) => store.upsert_session_record(r),
        }
    }
}
