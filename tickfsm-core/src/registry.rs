//! Registry of processing groups, definition buckets, and live instances.
//!
//! ```text
//! Registry
//!   └── group name ──► definition name ──► Bucket
//!                                            ├── Arc<Definition>
//!                                            ├── instances (insertion order)
//!                                            └── process rate + counter
//! ```
//!
//! The registry is a cheap cloneable handle over a single lock. No lock is
//! ever held while user code runs, so callbacks may create or destroy
//! instances through a registry handle during a tick.
//!
//! Error counters live beside the buckets, so every destroy path drops the
//! counters of whatever it removed.

use crate::context::Context;
use crate::definition::{Definition, ProcessRate};
use crate::degradation::Degradation;
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::error::FsmError;
use crate::instance::{Handle, Instance, InstanceId, InstanceSnapshot};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

/// Whether `register_definition` created or replaced a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Replaced,
}

/// One definition with its live instances and throttling state.
pub struct Bucket<C> {
    definition: Arc<Definition<C>>,
    instances: Vec<Arc<Instance<C>>>,
    process_rate: ProcessRate,
    counter: u32,
}

impl<C: Context> Bucket<C> {
    fn new(definition: Arc<Definition<C>>, process_rate: ProcessRate) -> Self {
        Self {
            definition,
            instances: Vec::new(),
            process_rate,
            counter: process_rate.period().unwrap_or(0),
        }
    }

    fn replace(&mut self, definition: Arc<Definition<C>>, process_rate: ProcessRate) {
        self.definition = definition;
        self.process_rate = process_rate;
        self.counter = process_rate.period().unwrap_or(0);
    }

    /// Advances the throttle by one tick.
    fn claim_tick(&mut self) -> TickClaim<C> {
        let Some(period) = self.process_rate.period() else {
            return TickClaim::Idle;
        };
        self.counter = self.counter.saturating_sub(1);
        if self.counter > 0 {
            return TickClaim::Throttled;
        }
        self.counter = period;
        TickClaim::Due(self.instances.clone())
    }

    fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.handle().id()).collect()
    }

    fn position(&self, id: InstanceId) -> Option<usize> {
        self.instances.iter().position(|i| i.handle().id() == id)
    }

    pub fn definition(&self) -> &Arc<Definition<C>> {
        &self.definition
    }

    pub fn process_rate(&self) -> ProcessRate {
        self.process_rate
    }

    /// Ticks remaining until the next step (0 for event-driven buckets).
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Outcome of asking a bucket for this tick's work.
pub(crate) enum TickClaim<C> {
    /// Bucket no longer exists.
    Missing,
    /// Rate 0; never stepped by `update`.
    Idle,
    /// Rate N; not this tick.
    Throttled,
    /// Snapshot of the instances to step, in insertion order.
    Due(Vec<Arc<Instance<C>>>),
}

struct RegistryState<C> {
    groups: HashMap<String, BTreeMap<String, Bucket<C>>>,
    next_id: u64,
}

impl<C: Context> RegistryState<C> {
    fn bucket(&self, group: &str, definition: &str) -> Option<&Bucket<C>> {
        self.groups.get(group)?.get(definition)
    }

    fn bucket_mut(&mut self, group: &str, definition: &str) -> Option<&mut Bucket<C>> {
        self.groups.get_mut(group)?.get_mut(definition)
    }

    fn instance(&self, handle: &Handle) -> Option<(&Bucket<C>, &Arc<Instance<C>>)> {
        let bucket = self.bucket(handle.group(), handle.definition())?;
        let index = bucket.position(handle.id())?;
        Some((bucket, &bucket.instances[index]))
    }
}

/// The group → definition → bucket registry.
pub struct Registry<C> {
    state: Arc<RwLock<RegistryState<C>>>,
    counters: Arc<Mutex<Degradation>>,
    diagnostics: Diagnostics,
}

/// Non-owning registry handle, for use inside callbacks.
pub struct WeakRegistry<C> {
    state: Weak<RwLock<RegistryState<C>>>,
    counters: Weak<Mutex<Degradation>>,
    diagnostics: Diagnostics,
}

impl<C> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            counters: self.counters.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

impl<C> Clone for WeakRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            counters: self.counters.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

impl<C> WeakRegistry<C> {
    /// Returns the registry if it is still alive.
    pub fn upgrade(&self) -> Option<Registry<C>> {
        let state = self.state.upgrade()?;
        let counters = self.counters.upgrade()?;
        Some(Registry {
            state,
            counters,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

fn require_name(kind: &str, value: &str) -> Result<(), FsmError> {
    if value.trim().is_empty() {
        return Err(FsmError::invalid_argument(format!(
            "{} name must not be blank",
            kind
        )));
    }
    Ok(())
}

impl<C: Context> Registry<C> {
    /// Creates an empty registry with its own diagnostic channel.
    pub fn new() -> Self {
        Self::with_diagnostics(Diagnostics::default())
    }

    /// Creates an empty registry publishing to the given channel.
    pub fn with_diagnostics(diagnostics: Diagnostics) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                groups: HashMap::new(),
                next_id: 1,
            })),
            counters: Arc::new(Mutex::new(Degradation::default())),
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn downgrade(&self) -> WeakRegistry<C> {
        WeakRegistry {
            state: Arc::downgrade(&self.state),
            counters: Arc::downgrade(&self.counters),
            diagnostics: self.diagnostics.clone(),
        }
    }

    // =========================================================================
    // Groups and definitions
    // =========================================================================

    /// Ensures a processing group exists.
    ///
    /// Returns the group's definition names (empty for a new group).
    pub fn get_or_create_group(&self, group: &str) -> Result<Vec<String>, FsmError> {
        require_name("group", group)?;
        let mut state = self.state.write();
        let buckets = state.groups.entry(group.to_string()).or_default();
        Ok(buckets.keys().cloned().collect())
    }

    /// Registers a definition under `name` in `group`.
    ///
    /// If a bucket already exists its definition is replaced wholesale and
    /// its throttle counter is reset; live instances step against the new
    /// definition from their next step on.
    pub fn register_definition(
        &self,
        name: &str,
        definition: impl Into<Arc<Definition<C>>>,
        process_rate: ProcessRate,
        group: &str,
    ) -> Result<Registration, FsmError> {
        require_name("definition", name)?;
        require_name("group", group)?;
        let definition = definition.into();

        let registration = {
            let mut state = self.state.write();
            let buckets = state.groups.entry(group.to_string()).or_default();
            match buckets.get_mut(name) {
                Some(bucket) => {
                    bucket.replace(definition, process_rate);
                    Registration::Replaced
                }
                None => {
                    buckets.insert(name.to_string(), Bucket::new(definition, process_rate));
                    Registration::Created
                }
            }
        };

        match registration {
            Registration::Created => self.diagnostics.publish(
                DiagnosticKind::Registered,
                format!("registered '{}' in group '{}' ({})", name, group, process_rate),
                None,
            ),
            Registration::Replaced => self.diagnostics.publish(
                DiagnosticKind::Redefined,
                format!("redefined '{}' in group '{}' ({})", name, group, process_rate),
                None,
            ),
        }
        Ok(registration)
    }

    /// Registers a definition under its own name and declared rate.
    pub fn register(
        &self,
        definition: Definition<C>,
        group: &str,
    ) -> Result<Registration, FsmError> {
        let name = definition.name().to_string();
        let rate = definition.process_rate();
        self.register_definition(&name, definition, rate, group)
    }

    /// Removes a definition bucket and every instance in it.
    ///
    /// Returns the number of instances destroyed, or None if the bucket did not exist.
    pub fn destroy_definition(&self, name: &str, group: &str) -> Option<usize> {
        let removed = {
            let mut state = self.state.write();
            state.groups.get_mut(group)?.remove(name)?
        };
        self.counters
            .lock()
            .forget_definition(group, name, &removed.instance_ids());
        self.diagnostics.publish(
            DiagnosticKind::DefinitionDestroyed,
            format!(
                "destroyed definition '{}' in group '{}' with {} instance(s)",
                name,
                group,
                removed.len()
            ),
            None,
        );
        Some(removed.len())
    }

    /// Removes a whole processing group. Returns false if it did not exist.
    pub fn destroy_group(&self, group: &str) -> bool {
        let removed = self.state.write().groups.remove(group);
        match removed {
            Some(buckets) => {
                let ids: Vec<InstanceId> =
                    buckets.values().flat_map(Bucket::instance_ids).collect();
                self.counters.lock().forget_group(group, &ids);
                let instances: usize = buckets.values().map(Bucket::len).sum();
                self.diagnostics.publish(
                    DiagnosticKind::GroupDestroyed,
                    format!(
                        "destroyed group '{}' ({} definition(s), {} instance(s))",
                        group,
                        buckets.len(),
                        instances
                    ),
                    None,
                );
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Binds a context to a registered definition.
    ///
    /// The instance starts in the definition's initial state, not yet entered.
    pub fn create_instance(
        &self,
        definition: &str,
        context: Arc<C>,
        group: &str,
    ) -> Result<Handle, FsmError> {
        require_name("definition", definition)?;
        require_name("group", group)?;

        let mut state = self.state.write();
        if !state.groups.contains_key(group) {
            return Err(FsmError::GroupNotFound {
                group: group.to_string(),
            });
        }

        let id = InstanceId::new(state.next_id);
        let bucket =
            state
                .bucket_mut(group, definition)
                .ok_or_else(|| FsmError::DefinitionNotFound {
                    group: group.to_string(),
                    definition: definition.to_string(),
                })?;

        let handle = Handle::new(id, group, definition);
        let initial = bucket.definition.initial().to_string();
        bucket
            .instances
            .push(Arc::new(Instance::new(handle.clone(), context, &initial)));
        state.next_id += 1;

        tracing::debug!("created instance {} in state '{}'", handle, initial);
        Ok(handle)
    }

    /// Removes an instance. Destroying a stale handle is a no-op.
    ///
    /// Returns true if an instance was removed.
    pub fn destroy_instance(&self, handle: &Handle) -> bool {
        let removed = {
            let mut state = self.state.write();
            match state.bucket_mut(handle.group(), handle.definition()) {
                Some(bucket) => match bucket.position(handle.id()) {
                    Some(index) => {
                        bucket.instances.remove(index);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            self.counters.lock().reset_instance_error_count(handle.id());
            self.diagnostics.publish(
                DiagnosticKind::InstanceDestroyed,
                format!("destroyed instance {}", handle),
                None,
            );
        }
        removed
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn contains_instance(&self, handle: &Handle) -> bool {
        self.state.read().instance(handle).is_some()
    }

    pub fn contains_definition(&self, name: &str, group: &str) -> bool {
        self.state.read().bucket(group, name).is_some()
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.state.read().groups.contains_key(group)
    }

    /// Current state name of a live instance.
    pub fn current_state(&self, handle: &Handle) -> Option<String> {
        let state = self.state.read();
        state.instance(handle).map(|(_, i)| i.cursor().state)
    }

    /// The definition a bucket currently holds.
    pub fn definition(&self, name: &str, group: &str) -> Option<Arc<Definition<C>>> {
        let state = self.state.read();
        state.bucket(group, name).map(|b| b.definition.clone())
    }

    pub fn process_rate(&self, name: &str, group: &str) -> Option<ProcessRate> {
        let state = self.state.read();
        state.bucket(group, name).map(|b| b.process_rate)
    }

    /// Definition names of a group in processing order, or None for an unknown group.
    pub fn definition_names(&self, group: &str) -> Option<Vec<String>> {
        let state = self.state.read();
        state.groups.get(group).map(|b| b.keys().cloned().collect())
    }

    /// All group names, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().groups.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handles of a bucket's live instances, in insertion order.
    pub fn instances(&self, name: &str, group: &str) -> Vec<Handle> {
        let state = self.state.read();
        state
            .bucket(group, name)
            .map(|b| b.instances.iter().map(|i| i.handle().clone()).collect())
            .unwrap_or_default()
    }

    /// Number of live instances in a group, or in every group when `group` is None.
    pub fn instance_count(&self, group: Option<&str>) -> usize {
        let state = self.state.read();
        state
            .groups
            .iter()
            .filter(|(name, _)| group.map_or(true, |g| g == name.as_str()))
            .flat_map(|(_, buckets)| buckets.values())
            .map(Bucket::len)
            .sum()
    }

    /// Serializable view of every group, bucket, and instance.
    pub fn snapshot(&self) -> RegistrySnapshot {
        // Copy instance references out first; snapshots call into contexts.
        let buckets: Vec<(String, String, ProcessRate, u32, Vec<Arc<Instance<C>>>)> = {
            let state = self.state.read();
            state
                .groups
                .iter()
                .flat_map(|(group, buckets)| {
                    buckets.iter().map(move |(name, b)| {
                        (
                            group.clone(),
                            name.clone(),
                            b.process_rate,
                            b.counter,
                            b.instances.clone(),
                        )
                    })
                })
                .collect()
        };

        let mut groups: BTreeMap<String, Vec<BucketSnapshot>> = BTreeMap::new();
        for (group, definition, process_rate, counter, instances) in buckets {
            groups.entry(group).or_default().push(BucketSnapshot {
                definition,
                process_rate,
                counter,
                instances: instances.iter().map(|i| i.snapshot()).collect(),
            });
        }
        RegistrySnapshot { groups }
    }

    // =========================================================================
    // Engine access
    // =========================================================================

    /// Error counters shared by every handle to this registry.
    pub(crate) fn counters(&self) -> MutexGuard<'_, Degradation> {
        self.counters.lock()
    }

    pub(crate) fn claim_tick(&self, group: &str, definition: &str) -> TickClaim<C> {
        let mut state = self.state.write();
        match state.bucket_mut(group, definition) {
            Some(bucket) => bucket.claim_tick(),
            None => TickClaim::Missing,
        }
    }

    /// Returns the bucket's current definition if the instance is still live.
    pub(crate) fn resolve(&self, handle: &Handle) -> Option<Arc<Definition<C>>> {
        let state = self.state.read();
        state
            .instance(handle)
            .map(|(bucket, _)| bucket.definition.clone())
    }

    pub(crate) fn entry(&self, handle: &Handle) -> Option<(Arc<Definition<C>>, Arc<Instance<C>>)> {
        let state = self.state.read();
        state
            .instance(handle)
            .map(|(bucket, instance)| (bucket.definition.clone(), instance.clone()))
    }
}

impl<C: Context> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Context> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("groups", &self.group_names())
            .field("instances", &self.instance_count(None))
            .finish()
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub definition: String,
    pub process_rate: ProcessRate,
    pub counter: u32,
    pub instances: Vec<InstanceSnapshot>,
}

/// Point-in-time view of a registry, keyed by group name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub groups: BTreeMap<String, Vec<BucketSnapshot>>,
}

impl RegistrySnapshot {
    pub fn instance_count(&self) -> usize {
        self.groups
            .values()
            .flatten()
            .map(|b| b.instances.len())
            .sum()
    }
}
