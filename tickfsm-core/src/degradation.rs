//! Error counters and the thresholds that turn failures into removals.
//!
//! Instance failures are counted per instance id. When an instance reaches
//! its threshold it is queued for destruction and one failure is credited to
//! its definition; a definition that reaches its own threshold is queued for
//! destruction together with every instance still in its bucket. Nothing is
//! destroyed inline: all removals go through the [`DeferredQueue`].

use crate::deferred::{DeferredOp, DeferredQueue};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::FsmError;
use crate::instance::{Handle, InstanceId};
use std::collections::HashMap;

pub const DEFAULT_INSTANCE_ERROR_THRESHOLD: u32 = 5;
pub const DEFAULT_DEFINITION_ERROR_THRESHOLD: u32 = 3;

/// Failure counters for instances and definitions.
#[derive(Debug)]
pub struct Degradation {
    instance_threshold: u32,
    definition_threshold: u32,
    instance_errors: HashMap<InstanceId, u32>,
    definition_errors: HashMap<(String, String), u32>,
}

impl Degradation {
    pub fn new(instance_threshold: u32, definition_threshold: u32) -> Self {
        Self {
            instance_threshold,
            definition_threshold,
            instance_errors: HashMap::new(),
            definition_errors: HashMap::new(),
        }
    }

    pub fn instance_threshold(&self) -> u32 {
        self.instance_threshold
    }

    pub fn definition_threshold(&self) -> u32 {
        self.definition_threshold
    }

    pub fn set_instance_threshold(&mut self, threshold: u32) {
        self.instance_threshold = threshold;
    }

    pub fn set_definition_threshold(&mut self, threshold: u32) {
        self.definition_threshold = threshold;
    }

    /// Counts one failure against an instance.
    ///
    /// Returns the running count; 0 means the threshold was reached and the
    /// instance has been queued for destruction.
    pub fn record_instance_error(
        &mut self,
        handle: &Handle,
        message: &str,
        error: Option<FsmError>,
        queue: &mut DeferredQueue,
        diagnostics: &Diagnostics,
    ) -> u32 {
        let threshold = self.instance_threshold.max(1);
        let count = {
            let count = self.instance_errors.entry(handle.id()).or_insert(0);
            *count += 1;
            *count
        };

        diagnostics.publish(
            DiagnosticKind::InstanceFailed,
            format!("{} ({}/{}): {}", handle, count, threshold, message),
            error,
        );

        if count < threshold {
            return count;
        }

        diagnostics.publish(
            DiagnosticKind::InstanceThreshold,
            format!(
                "{} reached {} error(s), scheduling removal",
                handle, threshold
            ),
            None,
        );
        self.instance_errors.remove(&handle.id());
        queue.push(DeferredOp::DestroyInstance(handle.clone()));
        queue.push(DeferredOp::RecordDefinitionError {
            group: handle.group().to_string(),
            definition: handle.definition().to_string(),
        });
        0
    }

    /// Records an instance whose context went invalid.
    ///
    /// The failure is counted like any other, and the instance is queued for
    /// removal right away since it can never step again.
    pub fn record_invalid_context(
        &mut self,
        handle: &Handle,
        context: &str,
        queue: &mut DeferredQueue,
        diagnostics: &Diagnostics,
    ) {
        let error = FsmError::InvalidContext {
            context: context.to_string(),
        };
        let remaining = self.record_instance_error(
            handle,
            "context is no longer valid",
            Some(error),
            queue,
            diagnostics,
        );
        if remaining > 0 {
            self.instance_errors.remove(&handle.id());
            queue.push(DeferredOp::DestroyInstance(handle.clone()));
        }
    }

    /// Counts one failure against a definition.
    ///
    /// Returns the running count; 0 means the threshold was reached and the
    /// definition has been queued for destruction.
    pub fn record_definition_error(
        &mut self,
        group: &str,
        definition: &str,
        queue: &mut DeferredQueue,
        diagnostics: &Diagnostics,
    ) -> u32 {
        let threshold = self.definition_threshold.max(1);
        let key = (group.to_string(), definition.to_string());
        let count = {
            let count = self.definition_errors.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        diagnostics.publish(
            DiagnosticKind::DefinitionFailed,
            format!(
                "definition '{}' in group '{}' failed ({}/{})",
                definition, group, count, threshold
            ),
            None,
        );

        if count < threshold {
            return count;
        }

        diagnostics.publish(
            DiagnosticKind::DefinitionThreshold,
            format!(
                "definition '{}' in group '{}' reached {} error(s), scheduling removal",
                definition, group, threshold
            ),
            None,
        );
        self.definition_errors.remove(&key);
        queue.push(DeferredOp::DestroyDefinition {
            group: group.to_string(),
            definition: definition.to_string(),
        });
        0
    }

    pub fn instance_error_count(&self, id: InstanceId) -> u32 {
        self.instance_errors.get(&id).copied().unwrap_or(0)
    }

    pub fn definition_error_count(&self, group: &str, definition: &str) -> u32 {
        self.definition_errors
            .get(&(group.to_string(), definition.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_instance_error_count(&mut self, id: InstanceId) {
        self.instance_errors.remove(&id);
    }

    pub fn reset_definition_error_count(&mut self, group: &str, definition: &str) {
        self.definition_errors
            .remove(&(group.to_string(), definition.to_string()));
    }

    pub fn reset_all(&mut self) {
        self.instance_errors.clear();
        self.definition_errors.clear();
    }

    /// Drops counters for a definition and its destroyed instances.
    pub fn forget_definition(&mut self, group: &str, definition: &str, instances: &[InstanceId]) {
        self.reset_definition_error_count(group, definition);
        for id in instances {
            self.instance_errors.remove(id);
        }
    }

    /// Drops every definition counter of a group and its instances' counters.
    pub fn forget_group(&mut self, group: &str, instances: &[InstanceId]) {
        self.definition_errors.retain(|(g, _), _| g != group);
        for id in instances {
            self.instance_errors.remove(id);
        }
    }
}

impl Default for Degradation {
    fn default() -> Self {
        Self::new(
            DEFAULT_INSTANCE_ERROR_THRESHOLD,
            DEFAULT_DEFINITION_ERROR_THRESHOLD,
        )
    }
}
