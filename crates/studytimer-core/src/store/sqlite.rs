//! SQLite-backed ledger.
//!
//! Provides persistent storage for:
//! - Tracking sessions and their topic segments
//! - Per-interval focus records
//! - Key-value store for the local timer snapshot

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{RemoteStore, SessionRecord, TimerSession, TopicTimeSegment, TrackingMode};
use crate::config::data_dir;
use crate::error::{PersistenceError, StoreError};
use crate::persistence::{PersistenceStore, TimerSnapshot};

/// kv key under which the timer snapshot lives.
pub const SNAPSHOT_KEY: &str = "timer_snapshot";

/// SQLite database for the tracking ledger.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database at `<data_dir>/studytimer.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = data_dir().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::open(dir.join("studytimer.db"))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS timer_sessions (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                started_at    TEXT NOT NULL,
                ended_at      TEXT,
                mode          TEXT NOT NULL,
                total_seconds INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS topic_segments (
                id               TEXT PRIMARY KEY,
                timer_session_id TEXT NOT NULL REFERENCES timer_sessions(id),
                topic_id         TEXT NOT NULL,
                user_id          TEXT NOT NULL,
                started_at       TEXT NOT NULL,
                ended_at         TEXT,
                duration_seconds INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS session_records (
                id               TEXT PRIMARY KEY,
                user_id          TEXT NOT NULL,
                mode             TEXT NOT NULL,
                started_at       TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                completed        INTEGER NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user_open ON timer_sessions(user_id, ended_at);
            CREATE INDEX IF NOT EXISTS idx_segments_session ON topic_segments(timer_session_id, started_at);
            CREATE INDEX IF NOT EXISTS idx_segments_user_topic ON topic_segments(user_id, topic_id);
            CREATE INDEX IF NOT EXISTS idx_segments_open ON topic_segments(ended_at);",
        )?;
        Ok(())
    }

    /// Get a value from the kv store.
    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Set a value in the kv store.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

const SESSION_COLUMNS: &str = "id, user_id, started_at, ended_at, mode, total_seconds";
const SEGMENT_COLUMNS: &str =
    "id, timer_session_id, topic_id, user_id, started_at, ended_at, duration_seconds";

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("bad timestamp '{raw}': {e}"),
        })
}

fn parse_opt_ts(table: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_ts(table, &r)).transpose()
}

struct SessionRow {
    id: String,
    user_id: String,
    started_at: String,
    ended_at: Option<String>,
    mode: String,
    total_seconds: u32,
}

impl SessionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            mode: row.get(4)?,
            total_seconds: row.get(5)?,
        })
    }

    fn decode(self) -> Result<TimerSession, StoreError> {
        let mode = self
            .mode
            .parse::<TrackingMode>()
            .map_err(|e| StoreError::Corrupt {
                table: "timer_sessions",
                message: e.to_string(),
            })?;
        Ok(TimerSession {
            started_at: parse_ts("timer_sessions", &self.started_at)?,
            ended_at: parse_opt_ts("timer_sessions", self.ended_at)?,
            id: self.id,
            user_id: self.user_id,
            mode,
            total_seconds: self.total_seconds,
        })
    }
}

struct SegmentRow {
    id: String,
    timer_session_id: String,
    topic_id: String,
    user_id: String,
    started_at: String,
    ended_at: Option<String>,
    duration_seconds: u32,
}

impl SegmentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timer_session_id: row.get(1)?,
            topic_id: row.get(2)?,
            user_id: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            duration_seconds: row.get(6)?,
        })
    }

    fn decode(self) -> Result<TopicTimeSegment, StoreError> {
        Ok(TopicTimeSegment {
            started_at: parse_ts("topic_segments", &self.started_at)?,
            ended_at: parse_opt_ts("topic_segments", self.ended_at)?,
            id: self.id,
            timer_session_id: self.timer_session_id,
            topic_id: self.topic_id,
            user_id: self.user_id,
            duration_seconds: self.duration_seconds,
        })
    }
}

impl SqliteStore {
    fn query_segments(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<TopicTimeSegment>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, SegmentRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(SegmentRow::decode).collect()
    }

    fn query_session(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<TimerSession>, StoreError> {
        let row = self
            .conn()
            .query_row(sql, args, SessionRow::read)
            .optional()?;
        row.map(SessionRow::decode).transpose()
    }
}

impl RemoteStore for SqliteStore {
    fn upsert_session(&self, session: &TimerSession) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO timer_sessions (id, user_id, started_at, ended_at, mode, total_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                ended_at = excluded.ended_at,
                mode = excluded.mode,
                total_seconds = excluded.total_seconds",
            params![
                session.id,
                session.user_id,
                ts(session.started_at),
                session.ended_at.map(ts),
                session.mode.as_str(),
                session.total_seconds,
            ],
        )?;
        Ok(())
    }

    fn upsert_segment(&self, segment: &TopicTimeSegment) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO topic_segments
                (id, timer_session_id, topic_id, user_id, started_at, ended_at, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                ended_at = COALESCE(topic_segments.ended_at, excluded.ended_at),
                duration_seconds = CASE WHEN topic_segments.ended_at IS NULL
                    THEN excluded.duration_seconds
                    ELSE topic_segments.duration_seconds END",
            params![
                segment.id,
                segment.timer_session_id,
                segment.topic_id,
                segment.user_id,
                ts(segment.started_at),
                segment.ended_at.map(ts),
                segment.duration_seconds,
            ],
        )?;
        Ok(())
    }

    fn query_open_session(&self, user_id: &str) -> Result<Option<TimerSession>, StoreError> {
        self.query_session(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM timer_sessions
                 WHERE user_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1"
            ),
            &[&user_id],
        )
    }

    fn query_open_segment(&self, session_id: &str) -> Result<Option<TopicTimeSegment>, StoreError> {
        let mut open = self.query_segments(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM topic_segments
                 WHERE timer_session_id = ?1 AND ended_at IS NULL
                 ORDER BY started_at DESC LIMIT 1"
            ),
            &[&session_id],
        )?;
        Ok(open.pop())
    }

    fn upsert_session_record(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO session_records
                (id, user_id, mode, started_at, duration_seconds, completed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                duration_seconds = excluded.duration_seconds,
                completed = excluded.completed,
                updated_at = excluded.updated_at",
            params![
                record.id,
                record.user_id,
                record.mode.as_str(),
                ts(record.started_at),
                record.duration_seconds,
                record.completed,
                ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn session(&self, session_id: &str) -> Result<Option<TimerSession>, StoreError> {
        self.query_session(
            &format!("SELECT {SESSION_COLUMNS} FROM timer_sessions WHERE id = ?1"),
            &[&session_id],
        )
    }

    fn segments_for_session(&self, session_id: &str) -> Result<Vec<TopicTimeSegment>, StoreError> {
        self.query_segments(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM topic_segments
                 WHERE timer_session_id = ?1
                 ORDER BY started_at ASC"
            ),
            &[&session_id],
        )
    }

    fn closed_topic_seconds(&self, user_id: &str, topic_id: &str) -> Result<u64, StoreError> {
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(duration_seconds), 0) FROM topic_segments
             WHERE user_id = ?1 AND topic_id = ?2 AND ended_at IS NOT NULL",
            params![user_id, topic_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn open_segments(&self) -> Result<Vec<TopicTimeSegment>, StoreError> {
        self.query_segments(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM topic_segments
                 WHERE ended_at IS NULL
                 ORDER BY started_at ASC"
            ),
            &[],
        )
    }

    fn session_record(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, user_id, mode, started_at, duration_seconds, completed, updated_at
                 FROM session_records WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, user_id, mode, started_at, duration_seconds, completed, updated_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            id,
            user_id,
            mode: mode.parse().map_err(|e: crate::error::ValidationError| {
                StoreError::Corrupt {
                    table: "session_records",
                    message: e.to_string(),
                }
            })?,
            started_at: parse_ts("session_records", &started_at)?,
            duration_seconds,
            completed,
            updated_at: parse_ts("session_records", &updated_at)?,
        }))
    }
}

/// The timer snapshot rides in the kv table, so a single database file holds
/// everything the CLI needs.
impl PersistenceStore for SqliteStore {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(snapshot)?;
        self.kv_set(SNAPSHOT_KEY, &json)
            .map_err(|e| PersistenceError::Backend(e.to_string()))
    }

    fn load(&self) -> Result<Option<TimerSnapshot>, PersistenceError> {
        let raw = self
            .kv_get(SNAPSHOT_KEY)
            .map_err(|e| PersistenceError::Backend(e.to_string()))?;
        raw.map(|json| serde_json::from_str(&json).map_err(PersistenceError::from))
            .transpose()
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.kv_delete(SNAPSHOT_KEY)
            .map_err(|e| PersistenceError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::timer::TimerMode;

    #[test]
    fn session_and_segment_upserts() {
        let store = SqliteStore::open_memory().unwrap();
        let clock = ManualClock::default();
        let mut session = TimerSession::open("u1", TrackingMode::Pomodoro, clock.now());
        store.upsert_session(&session).unwrap();

        let mut seg = TopicTimeSegment::open(&session, "chemistry", clock.now());
        store.upsert_segment(&seg).unwrap();
        assert_eq!(store.query_open_session("u1").unwrap(), Some(session.clone()));
        assert_eq!(store.query_open_segment(&session.id).unwrap(), Some(seg.clone()));

        clock.advance_secs(95);
        seg.close(clock.now());
        store.upsert_segment(&seg).unwrap();
        assert!(store.query_open_segment(&session.id).unwrap().is_none());
        assert_eq!(store.closed_topic_seconds("u1", "chemistry").unwrap(), 95);

        session.ended_at = Some(clock.now());
        session.total_seconds = 95;
        store.upsert_session(&session).unwrap();
        assert!(store.query_open_session("u1").unwrap().is_none());
        assert_eq!(store.session(&session.id).unwrap(), Some(session));
    }

    #[test]
    fn closed_segment_is_never_reopened() {
        let store = SqliteStore::open_memory().unwrap();
        let clock = ManualClock::default();
        let session = TimerSession::open("u1", TrackingMode::FreeStudy, clock.now());
        store.upsert_session(&session).unwrap();

        let mut seg = TopicTimeSegment::open(&session, "chemistry", clock.now());
        clock.advance_secs(30);
        seg.duration_seconds = 30;
        let partial = seg.clone();
        clock.advance_secs(10);
        seg.close(clock.now());
        store.upsert_segment(&seg).unwrap();

        // A partial update that lost the race to the close.
        store.upsert_segment(&partial).unwrap();
        assert!(store.query_open_segment(&session.id).unwrap().is_none());
        assert_eq!(store.closed_topic_seconds("u1", "chemistry").unwrap(), 40);
    }

    #[test]
    fn session_record_upsert_is_idempotent() {
        let store = SqliteStore::open_memory().unwrap();
        let clock = ManualClock::default();
        let mut record = SessionRecord {
            id: SessionRecord::key("u1", clock.now()),
            user_id: "u1".into(),
            mode: TimerMode::Work,
            started_at: clock.now(),
            duration_seconds: 60,
            completed: false,
            updated_at: clock.now(),
        };
        store.upsert_session_record(&record).unwrap();
        store.upsert_session_record(&record).unwrap();
        record.duration_seconds = 1500;
        record.completed = true;
        store.upsert_session_record(&record).unwrap();
        assert_eq!(store.session_record(&record.id).unwrap(), Some(record));
    }

    #[test]
    fn kv_store() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.kv_get("test").unwrap().is_none());
        store.kv_set("test", "hello").unwrap();
        assert_eq!(store.kv_get("test").unwrap().as_deref(), Some("hello"));
        store.kv_delete("test").unwrap();
        assert!(store.kv_get("test").unwrap().is_none());
    }
}
