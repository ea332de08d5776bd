//! Infrastructure layer with external service adapters.

/// Browser capability tables.
pub mod capabilities;
/// Application configuration.
pub mod config;
/// Outbound HTTP client for source images.
pub mod http;
/// Image engine.
pub mod image;
/// Storage backends.
pub mod storage;

pub use capabilities::load_capabilities;
pub use config::{AppConfig, CliArgs, ConfigError, ConfigLoader, LogLevel};
pub use http::HttpUpstream;
pub use image::ImageRsEngine;
pub use storage::{LocalStorage, ObjectStorage, build_storage};
