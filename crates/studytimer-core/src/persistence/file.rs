use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{PersistenceStore, TimerSnapshot};
use crate::error::PersistenceError;

/// JSON snapshot file.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn write(&self, snapshot: &TimerSnapshot, sync: bool) -> Result<(), PersistenceError> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| self.io_err(e))?;
        file.write_all(&data).map_err(|e| self.io_err(e))?;
        if sync {
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl PersistenceStore for FileSnapshotStore {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.write(snapshot, false)
    }

    fn save_blocking(&self, snapshot: &TimerSnapshot) -> Result<(), PersistenceError> {
        self.write(snapshot, true)
    }

    fn load(&self) -> Result<Option<TimerSnapshot>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}
