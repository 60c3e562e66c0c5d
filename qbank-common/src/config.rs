//! Configuration loading and resolution
//!
//! Values are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::db::models::ContextLevel;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the TOML config file
pub const CONFIG_ENV_VAR: &str = "QBANK_CONFIG";

/// Environment variable naming the SQLite database file
pub const DATABASE_ENV_VAR: &str = "QBANK_DATABASE";

/// How item content is compared when building duplicate signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Literal equality of the content payload
    #[default]
    Strict,
    /// Content passed through the label normalizer first
    Normalized,
}

/// Optional classifier adjunct endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub endpoint: String,
    #[serde(default = "default_classifier_timeout_ms")]
    pub timeout_ms: u64,
}

/// Settings for the consolidation engine and its operator binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub database_path: Option<PathBuf>,
    pub canonical_label: String,
    pub anchor_label: Option<String>,
    pub anchor_record: Option<i64>,
    pub primary_levels: Vec<ContextLevel>,
    pub secondary_levels: Vec<ContextLevel>,
    pub batch_size: usize,
    pub max_container_batch: usize,
    pub max_item_batch: usize,
    pub max_tree_depth: usize,
    pub max_bulk_iterations: usize,
    pub error_cap: usize,
    pub scan_page_size: usize,
    pub match_mode: MatchMode,
    pub default_container_patterns: Vec<String>,
    pub lock_wait_ms: u64,
    pub log_level: String,
    pub classifier: Option<ClassifierConfig>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            canonical_label: "Shared".to_string(),
            anchor_label: None,
            anchor_record: None,
            primary_levels: vec![ContextLevel::System],
            secondary_levels: vec![ContextLevel::Coursecat],
            batch_size: 100,
            max_container_batch: 100,
            max_item_batch: 500,
            max_tree_depth: 64,
            max_bulk_iterations: 10_000,
            error_cap: 20,
            scan_page_size: 1000,
            match_mode: MatchMode::Strict,
            default_container_patterns: vec!["default for ".to_string(), "top".to_string()],
            lock_wait_ms: 5000,
            log_level: "info".to_string(),
            classifier: None,
        }
    }
}

fn default_classifier_timeout_ms() -> u64 {
    3000
}

impl ConsolidationConfig {
    /// Load configuration: explicit file, else `QBANK_CONFIG`, else the
    /// platform config file if present, else defaults
    pub fn load(cli_config: Option<&Path>) -> Result<Self> {
        let config = match resolve_config_path(cli_config)? {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))
    }

    /// Reject values that would stall or unbound the engine
    pub fn validate(&self) -> Result<()> {
        if self.canonical_label.trim().is_empty() {
            return Err(Error::Config("canonical_label must not be empty".to_string()));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("max_container_batch", self.max_container_batch),
            ("max_item_batch", self.max_item_batch),
            ("max_tree_depth", self.max_tree_depth),
            ("max_bulk_iterations", self.max_bulk_iterations),
            ("scan_page_size", self.scan_page_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if let Some(classifier) = &self.classifier {
            if classifier.endpoint.trim().is_empty() {
                return Err(Error::Config("classifier.endpoint must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Database file: CLI argument, `QBANK_DATABASE`, TOML value, platform default
    pub fn resolve_database_path(&self, cli_arg: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_arg {
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.database_path {
            return path.clone();
        }

        default_database_path()
    }
}

/// Locate the TOML file to load, if any
///
/// An explicitly named file (argument or environment) must exist; the
/// platform locations are optional.
fn resolve_config_path(cli_arg: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = cli_arg {
        if !path.exists() {
            return Err(Error::Config(format!("Config file not found: {}", path.display())));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(Error::Config(format!(
                "{} points to a missing file: {}",
                CONFIG_ENV_VAR,
                path.display()
            )));
        }
        return Ok(Some(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("qbank").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(Some(path));
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/qbank/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }
    }

    Ok(None)
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("qbank"))
        .unwrap_or_else(|| PathBuf::from("./qbank_data"))
        .join("qbank.db")
}
