//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TICKFSM_CONFIG or --config)
//! 3. Environment variables

use crate::degradation::{DEFAULT_DEFINITION_ERROR_THRESHOLD, DEFAULT_INSTANCE_ERROR_THRESHOLD};
use crate::diagnostics::DEFAULT_DIAGNOSTIC_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Group ticked by `Engine::update_default`.
pub const DEFAULT_GROUP: &str = "default";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failures before an instance is removed.
    pub instance_error_threshold: u32,
    /// Credited failures before a definition is removed.
    pub definition_error_threshold: u32,
    /// Group used when no group is named.
    pub default_group: String,
    /// Undelivered diagnostics buffered per subscriber.
    pub diagnostic_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_error_threshold: DEFAULT_INSTANCE_ERROR_THRESHOLD,
            definition_error_threshold: DEFAULT_DEFINITION_ERROR_THRESHOLD,
            default_group: DEFAULT_GROUP.to_string(),
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TICKFSM_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("TICKFSM_INSTANCE_ERROR_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.instance_error_threshold = n;
        }
        if let Some(n) = lookup("TICKFSM_DEFINITION_ERROR_THRESHOLD").and_then(|v| v.parse().ok())
        {
            self.definition_error_threshold = n;
        }
        if let Some(group) = lookup("TICKFSM_DEFAULT_GROUP") {
            self.default_group = group;
        }
        if let Some(n) = lookup("TICKFSM_DIAGNOSTIC_CAPACITY").and_then(|v| v.parse().ok()) {
            self.diagnostic_capacity = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_group.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_group must not be blank".to_string(),
            ));
        }
        if self.diagnostic_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "diagnostic_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}
