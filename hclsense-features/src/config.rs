//! Configuration parsing and management.

use hclsense_incremental::ValidationOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "hclsense.yml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Main settings struct matching the hclsense.yml schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub validation: ValidationSettings,

    #[serde(default)]
    pub indexing: IndexingSettings,

    #[serde(default)]
    pub changes: ChangeSettings,

    #[serde(default)]
    pub jobs: JobSettings,

    #[serde(default)]
    pub features: FeatureToggles,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    #[serde(default = "default_true")]
    pub enable_enhanced_validation: bool,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        ValidationSettings {
            enable_enhanced_validation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_ignore_directory_names")]
    pub ignore_directory_names: Vec<String>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

fn default_ignore_directory_names() -> Vec<String> {
    vec![".git".to_string(), ".terraform".to_string()]
}

impl Default for IndexingSettings {
    fn default() -> Self {
        IndexingSettings {
            parallelism: default_parallelism(),
            ignore_directory_names: default_ignore_directory_names(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSettings {
    #[serde(default = "default_max_timespan_ms")]
    pub max_timespan_ms: u64,
}

fn default_max_timespan_ms() -> u64 {
    1000
}

impl Default for ChangeSettings {
    fn default() -> Self {
        ChangeSettings {
            max_timespan_ms: default_max_timespan_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_outcome_cache_size")]
    pub outcome_cache_size: usize,
}

fn default_outcome_cache_size() -> usize {
    hclsense_incremental::state::DEFAULT_OUTCOME_CAPACITY
}

impl Default for JobSettings {
    fn default() -> Self {
        JobSettings {
            outcome_cache_size: default_outcome_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub modules: bool,

    #[serde(default = "default_true")]
    pub stacks: bool,

    #[serde(default = "default_true")]
    pub search: bool,

    #[serde(default = "default_true")]
    pub variables: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        FeatureToggles {
            modules: true,
            stacks: true,
            search: true,
            variables: true,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse settings from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = if contents.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            tracing::debug!(path = %path.display(), "loading settings");
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "settings file not found, using defaults");
            Ok(Settings::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.indexing.parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                field: "indexing.parallelism",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.jobs.outcome_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "jobs.outcome_cache_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            enable_enhanced_validation: self.validation.enable_enhanced_validation,
        }
    }

    pub fn max_change_timespan(&self) -> Duration {
        Duration::from_millis(self.changes.max_timespan_ms)
    }

    /// Whether a directory with this name is skipped while walking
    pub fn is_ignored_dir_name(&self, name: &str) -> bool {
        self.indexing
            .ignore_directory_names
            .iter()
            .any(|ignored| ignored == name)
    }
}
