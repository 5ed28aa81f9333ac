//! Configuration for canopy
//!
//! Engine tuning lives in [`ConsolidationConfig`], which is passed explicitly to
//! every stage. [`Settings`] wraps it together with the oracle settings and is
//! read from `~/.config/canopy/config.toml`.

use crate::error::ConsolidationError;
use crate::oracle::models::Model;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const KEYRING_SERVICE: &str = "canopy";
const KEYRING_USERNAME: &str = "openrouter_api_key";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Thresholds, batch sizes, concurrency limits and feature toggles for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Pairwise score at or above which two themes join the same merge group.
    pub merge_threshold: f64,
    /// Below this lexical name similarity, pairs with no shared file skip the oracle.
    pub prefilter_name_threshold: f64,
    pub cache_ttl_minutes: i64,
    /// Oracle batches in flight at once (similarity, domains, cross-level).
    pub max_concurrency: usize,
    /// Similarity batching aims for roughly this many batches.
    pub target_batch_count: usize,
    pub max_batch_size: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub domain_hierarchy: bool,
    pub min_themes_for_parent: usize,
    pub expansion: bool,
    /// Safety cap on recursion depth; the oracle decides atomicity, not this.
    pub max_expansion_depth: u32,
    /// Abort the whole run with the partition error instead of keeping the
    /// offending node unexpanded. The error propagates through every ancestor
    /// and `run` returns no tree; sibling subtrees still finish first.
    pub strict_partition: bool,
    pub sibling_dedup: bool,
    /// Second duplicate-detection pass across all first-pass survivors.
    pub cross_batch_dedup: bool,
    pub cross_level_dedup: bool,
    pub cross_level_threshold: f64,
    /// Cross-level pairs whose sizes differ by more than this factor are skipped.
    pub size_mismatch_ratio: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.7,
            prefilter_name_threshold: 0.1,
            cache_ttl_minutes: 30,
            max_concurrency: 4,
            target_batch_count: 8,
            max_batch_size: 20,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            domain_hierarchy: true,
            min_themes_for_parent: 2,
            expansion: true,
            max_expansion_depth: 20,
            strict_partition: false,
            sibling_dedup: true,
            cross_batch_dedup: true,
            cross_level_dedup: true,
            cross_level_threshold: 0.95,
            size_mismatch_ratio: 10.0,
        }
    }
}

impl ConsolidationConfig {
    /// Reject values that would make a stage meaningless or hang.
    pub fn validate(&self) -> Result<(), ConsolidationError> {
        let unit = |name: &str, value: f64| -> Result<(), ConsolidationError> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConsolidationError::Configuration(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )))
            }
        };
        unit("merge_threshold", self.merge_threshold)?;
        unit("prefilter_name_threshold", self.prefilter_name_threshold)?;
        unit("cross_level_threshold", self.cross_level_threshold)?;

        if self.max_concurrency == 0 {
            return Err(ConsolidationError::Configuration(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.target_batch_count == 0 || self.max_batch_size == 0 {
            return Err(ConsolidationError::Configuration(
                "batch sizing values must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConsolidationError::Configuration(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.cache_ttl_minutes <= 0 {
            return Err(ConsolidationError::Configuration(
                "cache_ttl_minutes must be positive".to_string(),
            ));
        }
        if self.size_mismatch_ratio < 1.0 {
            return Err(ConsolidationError::Configuration(format!(
                "size_mismatch_ratio must be >= 1, got {}",
                self.size_mismatch_ratio
            )));
        }
        Ok(())
    }

    /// Settings for tests: no backoff sleeps, everything else default.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            retry_backoff_ms: 0,
            ..Self::default()
        }
    }
}

/// Oracle-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub model: Model,
    pub request_timeout_secs: u64,
    /// Legacy plaintext key; the environment and keychain take precedence.
    pub openrouter_api_key: Option<String>,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            model: Model::Speed,
            request_timeout_secs: 60,
            openrouter_api_key: None,
        }
    }
}

/// Everything the CLI reads from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub consolidation: ConsolidationConfig,
    pub oracle: OracleSettings,
}

impl Settings {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("canopy"))
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load from the default location, or return defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`. A missing file yields defaults; a corrupt one is kept
    /// aside as `config.toml.corrupt` and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&content) {
            Ok(settings) => settings,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file is corrupt; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Strict variant for explicit `--config` paths: missing or invalid files are errors.
    pub fn load_required(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {}", path.display(), e))?;
        Ok(settings)
    }

    /// OpenRouter API key: environment first, then keychain, then the config file.
    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }

        match read_keyring_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => {
                warn!(
                    error = %err,
                    "failed to read API key from system keychain; set {} instead",
                    API_KEY_ENV
                );
            }
        }

        self.oracle.openrouter_api_key.clone()
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
