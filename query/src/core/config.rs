use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::utils::file::expand_path;

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_MAX_FILTERS, DEFAULT_MAX_PAGE_SIZE,
    DEFAULT_PAGE_SIZE,
};

// =============================================================================
// File Configuration
// =============================================================================

/// Query limits section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueryFileConfig {
    pub default_page_size: Option<u64>,
    pub max_page_size: Option<u64>,
    pub max_filters: Option<usize>,
}

/// Output section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OutputFileConfig {
    pub pretty: Option<bool>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub query: Option<QueryFileConfig>,
    pub output: Option<OutputFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        if let serde_json::Value::Object(map) = &self.extra
            && !map.is_empty()
        {
            let keys_str: String = map
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                fields = %keys_str,
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence)
    fn merge(&mut self, other: FileConfig) {
        if let Some(query) = other.query {
            let current = self.query.get_or_insert_with(QueryFileConfig::default);
            if query.default_page_size.is_some() {
                tracing::trace!(value = ?query.default_page_size, "Merging query.default_page_size");
                current.default_page_size = query.default_page_size;
            }
            if query.max_page_size.is_some() {
                tracing::trace!(value = ?query.max_page_size, "Merging query.max_page_size");
                current.max_page_size = query.max_page_size;
            }
            if query.max_filters.is_some() {
                tracing::trace!(value = ?query.max_filters, "Merging query.max_filters");
                current.max_filters = query.max_filters;
            }
        }

        if let Some(output) = other.output {
            let current = self.output.get_or_insert_with(OutputFileConfig::default);
            if output.pretty.is_some() {
                current.pretty = output.pretty;
            }
        }
    }
}

// =============================================================================
// Resolved Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub max_filters: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub pretty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub query: QueryConfig,
    pub output: OutputConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            query: QueryConfig {
                default_page_size: DEFAULT_PAGE_SIZE,
                max_page_size: DEFAULT_MAX_PAGE_SIZE,
                max_filters: DEFAULT_MAX_FILTERS,
            },
            output: OutputConfig { pretty: false },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.tracelens/tracelens.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        Self::load_layered(cli, get_profile_config_path())
    }

    /// Load with an explicit profile config location
    fn load_layered(cli: &CliConfig, profile_path: Option<PathBuf>) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        if let Some(profile_path) = profile_path
            && profile_path.exists()
        {
            let profile_config = FileConfig::load_from_file(&profile_path)?;
            profile_config.warn_unknown_fields();
            file_config.merge(profile_config);
            found_configs.push(profile_path.display().to_string());
        }

        let overlay_path = if let Some(ref path) = cli.config {
            let expanded = expand_path(&path.to_string_lossy());
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            let overlay_config = FileConfig::load_from_file(&path)?;
            overlay_config.warn_unknown_fields();
            file_config.merge(overlay_config);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        let config = Self::resolve(file_config, cli);
        config.validate()?;
        tracing::debug!(config = ?config, "Configuration resolved");
        Ok(config)
    }

    /// Layer defaults -> file config -> CLI/env overrides
    fn resolve(file_config: FileConfig, cli: &CliConfig) -> Self {
        let defaults = Self::default();
        let file_query = file_config.query.unwrap_or_default();
        let file_output = file_config.output.unwrap_or_default();

        let query = QueryConfig {
            default_page_size: cli
                .default_page_size
                .or(file_query.default_page_size)
                .unwrap_or(defaults.query.default_page_size),
            max_page_size: cli
                .max_page_size
                .or(file_query.max_page_size)
                .unwrap_or(defaults.query.max_page_size),
            max_filters: cli
                .max_filters
                .or(file_query.max_filters)
                .unwrap_or(defaults.query.max_filters),
        };
        let output = OutputConfig {
            pretty: file_output.pretty.unwrap_or(defaults.output.pretty),
        };

        Self { query, output }
    }

    fn validate(&self) -> Result<()> {
        if self.query.default_page_size == 0 {
            anyhow::bail!("Configuration error: query.default_page_size must be greater than 0");
        }
        if self.query.max_page_size == 0 {
            anyhow::bail!("Configuration error: query.max_page_size must be greater than 0");
        }
        if self.query.default_page_size > self.query.max_page_size {
            anyhow::bail!(
                "Configuration error: query.default_page_size ({}) cannot exceed query.max_page_size ({})",
                self.query.default_page_size,
                self.query.max_page_size
            );
        }
        Ok(())
    }
}

/// Get the profile config path (~/.tracelens/tracelens.json)
fn get_profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}
