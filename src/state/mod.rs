// Persistent configuration and operator commands

pub mod commands;
pub mod config;
pub mod settings;

pub use commands::AdminCommands;
pub use config::{ConfigManager, ConnectionStore, JsonConnectionStore};
pub use settings::AppSettings;
