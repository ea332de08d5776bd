//! Application configuration.

pub mod app_config;
pub mod args;
pub mod duration;
pub mod loader;

pub use app_config::{
    AppConfig, CapabilitiesConfig, DEFAULT_CONFIG_FILE, LogLevel, MatchRuleConfig, StorageConfig,
    UpstreamConfig,
};
pub use args::CliArgs;
pub use duration::parse_duration;
pub use loader::{ConfigError, ConfigLoader};
