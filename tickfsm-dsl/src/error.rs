//! DSL error types.

use std::path::PathBuf;
use thiserror::Error;
use tickfsm_core::{BuildError, FsmError};

/// Errors from guard parsing and machine document loading.
#[derive(Debug, Error)]
pub enum DslError {
    #[error("invalid guard '{expr}' at offset {offset}: {reason}")]
    InvalidGuard {
        expr: String,
        offset: usize,
        reason: String,
    },

    #[error("invalid machine '{machine}': {reason}")]
    InvalidMachine { machine: String, reason: String },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DslError {
    pub(crate) fn machine(machine: &str, reason: impl Into<String>) -> Self {
        DslError::InvalidMachine {
            machine: machine.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns a stable error code for logs and diagnostics.
    pub fn error_code(&self) -> &'static str {
        match self {
            DslError::InvalidGuard { .. } => "INVALID_GUARD",
            DslError::InvalidMachine { .. } => "INVALID_MACHINE",
            DslError::Build(_) => "BUILD_FAILED",
            DslError::Fsm(e) => e.error_code(),
            DslError::Yaml(_) => "YAML_ERROR",
            DslError::Json(_) => "JSON_ERROR",
            DslError::Io { .. } => "IO_ERROR",
        }
    }
}
