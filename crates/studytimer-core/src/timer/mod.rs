mod engine;
mod mode;
mod settings;

pub use engine::{TimerEngine, TimerView, DEFAULT_SAVE_INTERVAL_SECS};
pub use mode::TimerMode;
pub use settings::TimerSettings;
