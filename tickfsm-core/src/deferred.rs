//! Queue of structural changes applied after a tick's iteration finishes.

use crate::instance::Handle;
use std::collections::VecDeque;
use std::fmt;

/// A structural change postponed until the current pass completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOp {
    /// Remove one instance from its bucket.
    DestroyInstance(Handle),
    /// Credit one failure to a definition.
    RecordDefinitionError { group: String, definition: String },
    /// Remove a definition bucket and all its instances.
    DestroyDefinition { group: String, definition: String },
}

impl DeferredOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferredOp::DestroyInstance(_) => "destroy_instance",
            DeferredOp::RecordDefinitionError { .. } => "record_definition_error",
            DeferredOp::DestroyDefinition { .. } => "destroy_definition",
        }
    }
}

impl fmt::Display for DeferredOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredOp::DestroyInstance(handle) => write!(f, "destroy instance {}", handle),
            DeferredOp::RecordDefinitionError { group, definition } => {
                write!(f, "record failure against '{}' in group '{}'", definition, group)
            }
            DeferredOp::DestroyDefinition { group, definition } => {
                write!(f, "destroy definition '{}' in group '{}'", definition, group)
            }
        }
    }
}

/// FIFO of pending [`DeferredOp`]s.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    ops: VecDeque<DeferredOp>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DeferredOp) {
        tracing::trace!("deferred {}", op);
        self.ops.push_back(op);
    }

    pub fn pop(&mut self) -> Option<DeferredOp> {
        self.ops.pop_front()
    }

    /// Pending operations, oldest first.
    pub fn pending(&self) -> Vec<DeferredOp> {
        self.ops.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
