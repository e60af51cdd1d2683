//! Diagnostic event channel.
//!
//! Every anomaly and every destructive lifecycle action is published here
//! and mirrored to `tracing`. Subscribers receive a
//! [`broadcast::Receiver`]; the channel works without an async runtime
//! (`try_recv` is synchronous). Lagging subscribers drop the oldest events.

use crate::error::FsmError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 1024;

/// What a diagnostic reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A definition was registered for the first time.
    Registered,
    /// An existing definition was replaced.
    Redefined,
    /// `update` was called for a blank or unknown group.
    UnknownGroup,
    /// A step failed or a context went invalid.
    InstanceFailed,
    /// An instance crossed its error threshold.
    InstanceThreshold,
    /// A failure was credited against a definition.
    DefinitionFailed,
    /// A definition crossed its error threshold.
    DefinitionThreshold,
    InstanceDestroyed,
    DefinitionDestroyed,
    GroupDestroyed,
    /// A queued deferred operation failed.
    DeferredFailed,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::Registered => "registered",
            DiagnosticKind::Redefined => "redefined",
            DiagnosticKind::UnknownGroup => "unknown_group",
            DiagnosticKind::InstanceFailed => "instance_failed",
            DiagnosticKind::InstanceThreshold => "instance_threshold",
            DiagnosticKind::DefinitionFailed => "definition_failed",
            DiagnosticKind::DefinitionThreshold => "definition_threshold",
            DiagnosticKind::InstanceDestroyed => "instance_destroyed",
            DiagnosticKind::DefinitionDestroyed => "definition_destroyed",
            DiagnosticKind::GroupDestroyed => "group_destroyed",
            DiagnosticKind::DeferredFailed => "deferred_failed",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One diagnostic event: a message and the error behind it, if any.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub error: Option<Arc<FsmError>>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

/// Publishing side of the diagnostic channel. Cheap to clone.
#[derive(Clone)]
pub struct Diagnostics {
    sender: broadcast::Sender<Diagnostic>,
}

impl Diagnostics {
    /// Creates a channel holding up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event and mirrors it to `tracing`.
    pub fn publish(&self, kind: DiagnosticKind, message: impl Into<String>, error: Option<FsmError>) {
        let message = message.into();
        let code = error.as_ref().map(FsmError::error_code).unwrap_or("-");
        match kind {
            DiagnosticKind::Registered
            | DiagnosticKind::Redefined
            | DiagnosticKind::InstanceDestroyed
            | DiagnosticKind::DefinitionDestroyed
            | DiagnosticKind::GroupDestroyed => {
                tracing::info!(kind = kind.as_str(), "{}", message)
            }
            DiagnosticKind::UnknownGroup
            | DiagnosticKind::InstanceFailed
            | DiagnosticKind::DefinitionFailed => match &error {
                Some(e) => tracing::warn!(kind = kind.as_str(), code, "{}: {}", message, e),
                None => tracing::warn!(kind = kind.as_str(), "{}", message),
            },
            DiagnosticKind::InstanceThreshold
            | DiagnosticKind::DefinitionThreshold
            | DiagnosticKind::DeferredFailed => match &error {
                Some(e) => tracing::error!(kind = kind.as_str(), code, "{}: {}", message, e),
                None => tracing::error!(kind = kind.as_str(), "{}", message),
            },
        }

        // Ignore send errors (no subscribers)
        let _ = self.sender.send(Diagnostic {
            kind,
            message,
            error: error.map(Arc::new),
        });
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Drains every event currently buffered for a subscriber.
pub fn drain(receiver: &mut broadcast::Receiver<Diagnostic>) -> Vec<Diagnostic> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!("diagnostic subscriber lagged, {} events dropped", skipped);
            }
            Err(_) => break,
        }
    }
    events
}
