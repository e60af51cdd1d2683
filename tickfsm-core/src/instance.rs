//! Live instances and the handles that name them.

use crate::context::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque instance identifier. Allocated monotonically per registry and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i-{}", self.0)
    }
}

/// Caller-facing reference to a live instance.
///
/// A handle stays usable after its instance is destroyed; operations on a
/// stale handle are no-ops or return `InstanceNotFound`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: InstanceId,
    group: Arc<str>,
    definition: Arc<str>,
}

impl Handle {
    pub(crate) fn new(id: InstanceId, group: &str, definition: &str) -> Self {
        Self {
            id,
            group: Arc::from(group),
            definition: Arc::from(definition),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Processing group the instance belongs to.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Name of the definition bucket the instance belongs to.
    pub fn definition(&self) -> &str {
        &self.definition
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.group, self.definition, self.id)
    }
}

/// Position of an instance inside its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub state: String,
    /// Whether `on_enter` has completed for `state`.
    pub entered: bool,
}

/// A definition bound to one context.
pub(crate) struct Instance<C> {
    handle: Handle,
    context: Arc<C>,
    cursor: Mutex<Cursor>,
}

impl<C: Context> Instance<C> {
    pub fn new(handle: Handle, context: Arc<C>, initial_state: &str) -> Self {
        Self {
            handle,
            context,
            cursor: Mutex::new(Cursor {
                state: initial_state.to_string(),
                entered: false,
            }),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    /// Copies the cursor out so no lock is held while user code runs.
    pub fn cursor(&self) -> Cursor {
        self.cursor.lock().clone()
    }

    /// Marks `state` as entered unless the instance has moved on meanwhile.
    pub fn mark_entered(&self, state: &str) {
        let mut cursor = self.cursor.lock();
        if cursor.state == state {
            cursor.entered = true;
        }
    }

    /// Moves from `from` to `to`, leaving `to` not yet entered.
    /// Returns false if the instance is no longer in `from`.
    pub fn move_from(&self, from: &str, to: &str) -> bool {
        let mut cursor = self.cursor.lock();
        if cursor.state != from {
            return false;
        }
        cursor.state = to.to_string();
        cursor.entered = false;
        true
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let cursor = self.cursor();
        InstanceSnapshot {
            id: self.handle.id,
            group: self.handle.group().to_string(),
            definition: self.handle.definition().to_string(),
            context: self.context.name().to_string(),
            state: cursor.state,
            entered: cursor.entered,
            valid: self.context.is_valid(),
        }
    }
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub group: String,
    pub definition: String,
    /// Display name of the bound context.
    pub context: String,
    pub state: String,
    pub entered: bool,
    pub valid: bool,
}
