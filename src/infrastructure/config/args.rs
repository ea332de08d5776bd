use super::app_config::LogLevel;
use crate::domain::entities::UrlCleanMode;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Default, Parser)]
#[command(
    name = "morphus",
    version,
    about = "On-demand image transformation proxy",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", env = "MORPHUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", env = "LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, env = "LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Address to bind.
    #[arg(long, env = "ADDRESS")]
    pub address: Option<IpAddr>,

    /// Port to bind.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Response cache lifetime (`1d`, `12h`, ...).
    #[arg(long, env = "MAX_AGE")]
    pub max_age: Option<String>,

    /// URL cleaning before hashing.
    #[arg(long, env = "CLEAN_URLS")]
    pub clean_urls: Option<UrlCleanMode>,

    /// Only accept `url` and `preset` parameters.
    #[arg(long, env = "ONLY_ALLOW_PRESETS")]
    pub only_allow_presets: Option<bool>,
}
