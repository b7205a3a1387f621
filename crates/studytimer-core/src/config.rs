//! TOML-based application configuration.
//!
//! Stores:
//! - Interval lengths and long-break cadence (`[timer]`)
//! - Tracking identity and sync cadence (`[tracking]`)
//! - Snapshot staleness and save cadence (`[persistence]`)
//! - Orphaned-segment limits (`[janitor]`)
//!
//! Configuration is stored at `~/.config/studytimer/config.toml`.
//! Every value is validated on load and on `set`; a rejected change leaves
//! the configuration untouched.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};
use crate::store::TrackingMode;
use crate::timer::TimerSettings;

/// Returns `~/.config/studytimer[-dev]/` based on STUDYTIMER_ENV.
///
/// Set STUDYTIMER_ENV=dev to use a development data directory.
pub fn data_dir() -> Result<PathBuf, std::io::Error> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("STUDYTIMER_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("studytimer-dev")
    } else {
        base_dir.join("studytimer")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Tracking identity and sync cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub default_mode: TrackingMode,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u32,
}

/// Local snapshot policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_staleness")]
    pub staleness_minutes: u32,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u32,
}

/// Limits for closing segments left open by a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_max_open_hours")]
    pub max_open_hours: u32,
    #[serde(default = "default_max_segment_minutes")]
    pub max_segment_minutes: u32,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/studytimer/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub timer: TimerSettings,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

// Default functions
fn default_user_id() -> String {
    "local".into()
}
fn default_sync_interval() -> u32 {
    30
}
fn default_staleness() -> u32 {
    30
}
fn default_save_interval() -> u32 {
    5
}
fn default_max_open_hours() -> u32 {
    12
}
fn default_max_segment_minutes() -> u32 {
    240
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            default_mode: TrackingMode::default(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            staleness_minutes: default_staleness(),
            save_interval_secs: default_save_interval(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            max_open_hours: default_max_open_hours(),
            max_segment_minutes: default_max_segment_minutes(),
        }
    }
}

impl PersistenceConfig {
    pub fn staleness(&self) -> Duration {
        Duration::minutes(i64::from(self.staleness_minutes))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::seconds(i64::from(self.save_interval_secs))
    }
}

impl TrackingConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::seconds(i64::from(self.sync_interval_secs))
    }
}

fn require_positive(field: &'static str, value: u32) -> Result<(), ValidationError> {
    if value == 0 {
        Err(ValidationError::NonPositive { field })
    } else {
        Ok(())
    }
}

impl Config {
    /// Check the sections that are not validated by construction.
    /// (`TimerSettings` cannot exist in an invalid state.)
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tracking.user_id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "tracking.user_id".into(),
                message: "must not be empty".into(),
            });
        }
        require_positive("tracking.sync_interval_secs", self.tracking.sync_interval_secs)?;
        require_positive("persistence.staleness_minutes", self.persistence.staleness_minutes)?;
        require_positive("persistence.save_interval_secs", self.persistence.save_interval_secs)?;
        require_positive("janitor.max_open_hours", self.janitor.max_open_hours)?;
        require_positive("janitor.max_segment_minutes", self.janitor.max_segment_minutes)?;
        Ok(())
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() || key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| ConfigError::ParseFailed(format!("{key}: {e}")))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value.parse::<i64>().map_err(|_| {
                            ConfigError::ParseFailed(format!("cannot parse '{value}' as integer"))
                        })?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value)
                            .map_err(|e| ConfigError::ParseFailed(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    pub fn path() -> Result<PathBuf, std::io::Error> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("config.toml"),
            message: e.to_string(),
        })?;
        Self::load_from(&path)
    }

    /// Load from `path`, writing defaults there if the file is missing.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Config = toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path().map_err(|e| ConfigError::SaveFailed {
            path: PathBuf::from("config.toml"),
            message: e.to_string(),
        })?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| save_failed(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Return a copy with `key` set to `value`, validated.
    ///
    /// `self` is never modified; callers swap in the returned value.
    pub fn with_value(&self, key: &str, value: &str) -> Result<Self, ConfigError> {
        let mut json =
            serde_json::to_value(self).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| {
            // `TimerSettings` validation surfaces here as a serde error.
            ConfigError::Invalid(ValidationError::InvalidValue {
                field: key.to_string(),
                message: e.to_string(),
            })
        })?;
        updated.validate()?;
        Ok(updated)
    }

    /// Set a config value by key and persist it to `path`.
    pub fn set_at(&mut self, path: &Path, key: &str, value: &str) -> Result<(), ConfigError> {
        let updated = self.with_value(key, value)?;
        updated.save_to(path)?;
        *self = updated;
        Ok(())
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}
