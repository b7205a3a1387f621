use clap::Subcommand;
use studytimer_core::{Config, ConfigError};

use super::{print_json, CmdResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the whole config as JSON
    Show,
    /// Get a config value
    Get {
        /// Dot-separated key (e.g. "timer.work_duration_minutes")
        key: String,
    },
    /// Set a config value
    Set {
        /// Dot-separated key
        key: String,
        /// New value
        value: String,
    },
}

pub fn run(action: ConfigAction) -> CmdResult {
    let path = Config::path()?;
    let mut config = Config::load_from(&path)?;

    match action {
        ConfigAction::Show => print_json(&config)?,
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{value}"),
            None => return Err(ConfigError::UnknownKey(key).into()),
        },
        ConfigAction::Set { key, value } => {
            config.set_at(&path, &key, &value)?;
            println!("ok");
        }
    }
    Ok(())
}
