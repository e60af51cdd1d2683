//! Core error types.

use std::fmt;
use thiserror::Error;

/// Error type returned by user callbacks and transition conditions.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle phase of a state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Enter,
    Update,
    Exit,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Enter => "enter",
            Phase::Update => "update",
            Phase::Exit => "exit",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the registry and the tick engine.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("processing group not found: {group}")]
    GroupNotFound { group: String },

    #[error("definition not found: {definition} (group '{group}')")]
    DefinitionNotFound { group: String, definition: String },

    #[error("instance not found: {instance}")]
    InstanceNotFound { instance: String },

    #[error("state '{state}' is not defined in '{definition}'")]
    MissingState { definition: String, state: String },

    #[error("{phase} callback of state '{state}' failed: {source}")]
    Callback {
        state: String,
        phase: Phase,
        #[source]
        source: CallbackError,
    },

    #[error("condition '{from}' -> '{to}' failed: {source}")]
    Condition {
        from: String,
        to: String,
        #[source]
        source: CallbackError,
    },

    #[error("panic in {site}: {message}")]
    Panicked { site: String, message: String },

    #[error("context '{context}' is no longer valid")]
    InvalidContext { context: String },
}

impl FsmError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        FsmError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns true for failures raised by user code while stepping an instance.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            FsmError::MissingState { .. }
                | FsmError::Callback { .. }
                | FsmError::Condition { .. }
                | FsmError::Panicked { .. }
                | FsmError::InvalidContext { .. }
        )
    }

    /// Returns a stable error code for logs and diagnostics.
    pub fn error_code(&self) -> &'static str {
        match self {
            FsmError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            FsmError::GroupNotFound { .. } => "GROUP_NOT_FOUND",
            FsmError::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            FsmError::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            FsmError::MissingState { .. } => "MISSING_STATE",
            FsmError::Callback { .. } => "CALLBACK_FAILED",
            FsmError::Condition { .. } => "CONDITION_FAILED",
            FsmError::Panicked { .. } => "PANICKED",
            FsmError::InvalidContext { .. } => "INVALID_CONTEXT",
        }
    }
}

/// Rejected definition or transition construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("definition name must not be blank")]
    MissingName,

    #[error("initial state not specified for '{definition}'")]
    MissingInitialState { definition: String },

    #[error("state name must not be blank")]
    BlankStateName,

    #[error("duplicate state '{state}' in '{definition}'")]
    DuplicateState { definition: String, state: String },

    #[error("transition source not specified. Call .from(state) or .from_any()")]
    MissingSource,

    #[error("transition target not specified. Call .to(state)")]
    MissingTarget,

    #[error("transition to '{to}' has no condition. Call .when(..) or .try_when(..)")]
    MissingCondition { to: String },
}
