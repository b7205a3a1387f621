//! # Studytimer Core Library
//!
//! This library provides the core logic for a focus/break interval timer
//! coupled with a per-topic time-tracking ledger. All operations are
//! available through the standalone `studytimer` CLI, which is a thin layer
//! over this crate.
//!
//! ## Architecture
//!
//! - **Timer Engine**: A wall-clock-based state machine; remaining time is
//!   always derived from an absolute end instant, never counted down
//! - **Persistence**: Local snapshot of the engine with a staleness window;
//!   restoration never resumes a running countdown
//! - **Recorder**: Per-minute partial and final focus records
//! - **Tracking**: Topic segments tied to a tracking session, periodic
//!   partial syncs, crash recovery and an orphaned-segment janitor
//! - **Store**: The durable ledger, SQLite-backed or in memory
//! - **Service**: Async driver with the tick task and a single store writer
//!
//! ## Key Components
//!
//! - [`TimerEngine`]: Core timer state machine
//! - [`TopicSegmentTracker`]: Segment lifecycle per user
//! - [`TimerService`]: Tokio driver tying the pieces together
//! - [`Config`]: Application configuration management

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod persistence;
pub mod recorder;
pub mod service;
pub mod store;
pub mod timer;
pub mod tracking;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{data_dir, Config, JanitorConfig, PersistenceConfig, TrackingConfig};
pub use error::{ConfigError, CoreError, PersistenceError, StoreError, ValidationError};
pub use events::Event;
pub use persistence::{
    FileSnapshotStore, MemorySnapshotStore, PersistenceStore, Snapshots, TimerSnapshot,
};
pub use recorder::SessionRecorder;
pub use service::{ServiceOptions, TimerService};
pub use store::{
    MemoryStore, RemoteStore, SessionRecord, SqliteStore, StoreWrite, TimerSession,
    TopicTimeSegment, TrackingMode,
};
pub use timer::{TimerEngine, TimerMode, TimerSettings, TimerView};
pub use tracking::{
    Janitor, JanitorReport, LiveSegment, Outbox, Recovery, SegmentSyncer, TopicSegmentTracker,
    TrackerState, WriteBatch,
};
