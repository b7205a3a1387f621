pub mod config;
pub mod janitor;
pub mod run;
pub mod timer;
pub mod topic;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use studytimer_core::{
    data_dir, Config, CoreError, Outbox, SharedClock, Snapshots, SqliteStore, SystemClock, TimerEngine,
};

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Everything a command needs from the data directory.
pub struct Context {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub clock: SharedClock,
    pub outbox_path: PathBuf,
}

impl Context {
    pub fn open() -> Result<Self, CoreError> {
        let config = Config::load()?;
        let store = Arc::new(SqliteStore::open_default()?);
        let outbox_path = data_dir()?.join("outbox.json");
        Ok(Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            outbox_path,
        })
    }

    /// The timer snapshot lives in the same database as the ledger.
    pub fn snapshots(&self) -> Snapshots {
        Snapshots::new(self.store.clone(), self.clock.clone())
            .with_staleness(self.config.persistence.staleness())
    }

    pub fn engine(&self) -> TimerEngine {
        TimerEngine::restore(
            Arc::new(self.config.timer.clone()),
            self.clock.clone(),
            self.snapshots(),
        )
        .with_save_interval(self.config.persistence.save_interval())
    }

    /// Outbox left behind by an earlier process, if any.
    pub fn load_outbox(&self, outbox: &Outbox) -> Result<(), std::io::Error> {
        outbox.load(&self.outbox_path)
    }

    pub fn save_outbox(&self, outbox: &Outbox) -> Result<(), std::io::Error> {
        outbox.persist(&self.outbox_path)
    }
}

pub fn print_json<T: Serialize>(value: &T) -> CmdResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
