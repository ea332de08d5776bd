//! Loads caniuse feature files into a [`CapabilityMatrix`].
//!
//! Only the `stats` table is read: `{ "stats": { "chrome": { "85": "y" } } }`.
//! Version keys may be ranges (`"4-6"`), whose lower bound is used.
//! Non-numeric keys such as `"TP"` are skipped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::services::{CapabilityMatrix, Feature};
use crate::infrastructure::config::{CapabilitiesConfig, ConfigError};

#[derive(Debug, Deserialize)]
struct FeatureFile {
    stats: HashMap<String, HashMap<String, String>>,
}

fn parse_version(key: &str) -> Option<f64> {
    key.split('-').next()?.trim().parse().ok()
}

fn is_supported(flags: &str) -> bool {
    flags.split_whitespace().next() == Some("y")
}

/// Adds every browser's first fully supporting version for `feature`.
///
/// # Errors
/// Returns [`ConfigError::Invalid`] if `content` is not a caniuse feature
/// document.
pub fn load_feature(
    matrix: &mut CapabilityMatrix,
    feature: Feature,
    content: &str,
) -> Result<(), ConfigError> {
    let file: FeatureFile = serde_json::from_str(content)
        .map_err(|e| ConfigError::invalid(format!("invalid caniuse data: {e}")))?;

    for (stat_id, versions) in file.stats {
        let minimum = versions
            .iter()
            .filter(|(_, flags)| is_supported(flags))
            .filter_map(|(key, _)| parse_version(key))
            .min_by(f64::total_cmp);
        if let Some(version) = minimum {
            debug!(?feature, stat_id = %stat_id, version, "Browser support");
            matrix.insert(feature, stat_id, version);
        }
    }
    Ok(())
}

fn load_file(matrix: &mut CapabilityMatrix, feature: Feature, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigError::invalid(format!("cannot read {}: {e}", path.display())))?;
    load_feature(matrix, feature, &content)
}

/// Builds the matrix from the configured files. Returns `None` when no file
/// is configured, which disables user-agent negotiation.
///
/// # Errors
/// Returns [`ConfigError`] if a configured file cannot be read or parsed.
pub fn load_capabilities(config: &CapabilitiesConfig) -> Result<Option<CapabilityMatrix>, ConfigError> {
    let mut matrix = CapabilityMatrix::new();
    for (feature, path) in [(Feature::Avif, &config.avif), (Feature::Webp, &config.webp)] {
        if let Some(path) = path {
            load_file(&mut matrix, feature, path)?;
        }
    }
    if matrix.is_empty() {
        return Ok(None);
    }
    info!("Loaded browser capability tables");
    Ok(Some(matrix))
}
