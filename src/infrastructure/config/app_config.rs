//! Application configuration.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::args::CliArgs;
use super::duration::parse_duration;
use super::loader::ConfigError;
use crate::domain::entities::UrlCleanMode;
use crate::domain::services::{AccessPolicy, MatchRule};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "morphus.toml";

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Allow-list entry: a prefix string or `{ regex = "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchRuleConfig {
    /// Prefix match.
    Prefix(String),
    /// Full-match regular expression.
    Pattern {
        /// Pattern source.
        regex: String,
    },
}

impl MatchRuleConfig {
    fn to_rule(&self) -> Result<MatchRule, ConfigError> {
        match self {
            Self::Prefix(prefix) => Ok(MatchRule::Prefix(prefix.clone())),
            Self::Pattern { regex } => MatchRule::pattern(regex)
                .map_err(|e| ConfigError::invalid(format!("invalid allow-list pattern `{regex}`: {e}"))),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Files under a local directory.
    Local {
        /// Root directory.
        #[serde(default = "default_assets")]
        assets: PathBuf,
    },
    /// MinIO or another S3-compatible server.
    Minio {
        /// Server URL.
        endpoint: String,
        /// Bucket name.
        bucket: String,
        /// Region passed to the signer.
        #[serde(default = "default_region")]
        region: String,
        /// Access key id.
        access_key: String,
        /// Secret access key.
        secret_key: String,
    },
    /// Amazon S3.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Bucket region.
        region: String,
        /// Access key id; falls back to the environment when unset.
        #[serde(default)]
        access_key: Option<String>,
        /// Secret access key; falls back to the environment when unset.
        #[serde(default)]
        secret_key: Option<String>,
    },
    /// Google Cloud Storage.
    Gcs {
        /// Bucket name.
        bucket: String,
        /// Service account key file; falls back to ambient credentials.
        #[serde(default)]
        key_filename: Option<PathBuf>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            assets: default_assets(),
        }
    }
}

impl StorageConfig {
    /// Backend name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Minio { .. } => "minio",
            Self::S3 { .. } => "s3",
            Self::Gcs { .. } => "gcs",
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(ConfigError::invalid(format!(
                    "storage.{field} is required for {} storage",
                    self.kind()
                )))
            } else {
                Ok(())
            }
        };
        match self {
            Self::Local { assets } => require("assets", &assets.to_string_lossy()),
            Self::Minio {
                endpoint,
                bucket,
                access_key,
                secret_key,
                ..
            } => {
                require("endpoint", endpoint)?;
                require("bucket", bucket)?;
                require("access_key", access_key)?;
                require("secret_key", secret_key)
            }
            Self::S3 { bucket, region, .. } => {
                require("bucket", bucket)?;
                require("region", region)
            }
            Self::Gcs { bucket, .. } => require("bucket", bucket),
        }
    }
}

/// Browser support tables for user-agent format negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// caniuse feature file for AVIF.
    #[serde(default)]
    pub avif: Option<PathBuf>,
    /// caniuse feature file for WebP.
    #[serde(default)]
    pub webp: Option<PathBuf>,
}

/// Source image download limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Whole-request timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Largest accepted source body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upstream_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path. Logs go to stdout when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Address to bind.
    #[serde(default = "default_address")]
    pub address: IpAddr,

    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Source URLs must match one of these. Unset disables the check.
    #[serde(default)]
    pub allowed_domains: Option<Vec<MatchRuleConfig>>,

    /// `Origin` headers must match one of these. Unset disables the check.
    #[serde(default)]
    pub allowed_hosts: Option<Vec<MatchRuleConfig>>,

    /// URL cleaning before hashing.
    #[serde(default)]
    pub clean_urls: UrlCleanMode,

    /// Response cache lifetime (`1d`, `12h`, ...).
    #[serde(default = "default_max_age")]
    pub max_age: String,

    /// Named query-string fragments.
    #[serde(default)]
    pub presets: HashMap<String, String>,

    /// Reject every parameter except `url` and `preset`.
    #[serde(default)]
    pub only_allow_presets: bool,

    /// Storage backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Browser support tables.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    /// Download limits.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Seconds in-flight requests get to finish after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_assets() -> PathBuf {
    PathBuf::from("./assets")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

const fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

const fn default_port() -> u16 {
    80
}

fn default_max_age() -> String {
    "1d".to_string()
}

const fn default_upstream_timeout() -> u64 {
    30
}

const fn default_max_body_bytes() -> u64 {
    50 * 1024 * 1024
}

const fn default_shutdown_grace() -> u64 {
    10
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: CliArgs) {
        if let Some(config_path) = args.config {
            self.config = Some(config_path);
        }
        if let Some(log_path) = args.log_path {
            self.log_path = Some(log_path);
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(address) = args.address {
            self.address = address;
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(max_age) = args.max_age {
            self.max_age = max_age;
        }
        if let Some(clean_urls) = args.clean_urls {
            self.clean_urls = clean_urls;
        }
        if let Some(only_allow_presets) = args.only_allow_presets {
            self.only_allow_presets = only_allow_presets;
        }
    }

    /// Checks everything that can be checked without I/O.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, list) in [
            ("allowed_domains", &self.allowed_domains),
            ("allowed_hosts", &self.allowed_hosts),
        ] {
            if list.as_ref().is_some_and(Vec::is_empty) {
                return Err(ConfigError::invalid(format!(
                    "{name} must contain at least one entry or be omitted"
                )));
            }
        }
        self.access_policy()?;
        self.max_age_duration()?;
        self.storage.validate()?;
        if self.only_allow_presets && self.presets.is_empty() {
            return Err(ConfigError::invalid(
                "only_allow_presets requires at least one preset",
            ));
        }
        Ok(())
    }

    /// Socket address to bind.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parsed `max_age`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if the string is not a duration.
    pub fn max_age_duration(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.max_age)
            .ok_or_else(|| ConfigError::invalid(format!("invalid max_age `{}`", self.max_age)))
    }

    /// Builds the allow-list policy.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if a pattern does not compile.
    pub fn access_policy(&self) -> Result<AccessPolicy, ConfigError> {
        let compile = |list: &Option<Vec<MatchRuleConfig>>| {
            list.as_ref()
                .map(|rules| rules.iter().map(MatchRuleConfig::to_rule).collect::<Result<Vec<_>, _>>())
                .transpose()
        };
        Ok(AccessPolicy::new(
            compile(&self.allowed_domains)?,
            compile(&self.allowed_hosts)?,
        ))
    }

    /// Grace period for in-flight requests on shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            address: default_address(),
            port: default_port(),
            allowed_domains: None,
            allowed_hosts: None,
            clean_urls: UrlCleanMode::default(),
            max_age: default_max_age(),
            presets: HashMap::new(),
            only_allow_presets: false,
            storage: StorageConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            upstream: UpstreamConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}
