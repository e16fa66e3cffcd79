//! Application configuration.

/// Settings read from `config.toml`.
pub mod app_config;
/// Command-line flags.
pub mod args;
/// Locating, reading and writing the config file.
pub mod storage;

pub use app_config::{AppConfig, LogLevel};
pub use args::CliArgs;
pub use storage::{ConfigError, ConfigStore};
