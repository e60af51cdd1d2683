//! Tick engine - steps instances, routes failures, applies deferred changes.

use crate::config::EngineConfig;
use crate::context::Context;
use crate::deferred::{DeferredOp, DeferredQueue};
use crate::definition::{Definition, State, Transition};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::{FsmError, Phase};
use crate::instance::{Handle, Instance};
use crate::registry::{Registry, TickClaim};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What one `update` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub group: String,
    pub buckets_stepped: usize,
    pub buckets_throttled: usize,
    /// Buckets with process rate 0.
    pub buckets_idle: usize,
    pub instances_stepped: usize,
    /// Instances destroyed earlier in the tick, or with an invalid context.
    pub instances_skipped: usize,
    pub transitions: usize,
    pub failures: usize,
    pub deferred_applied: usize,
}

impl TickSummary {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Self::default()
        }
    }
}

/// Result of stepping one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No transition fired.
    Stayed,
    /// A transition fired; the target is entered on the next step.
    Transitioned { from: String, to: String },
    /// The step failed and was recorded as an instance error.
    Failed,
}

/// Drives processing groups of a [`Registry`] one tick at a time.
pub struct Engine<C: Context> {
    registry: Registry<C>,
    deferred: Mutex<DeferredQueue>,
    default_group: String,
}

impl<C: Context> Engine<C> {
    /// Creates an engine with default configuration and a fresh registry.
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        let registry = Registry::with_diagnostics(Diagnostics::new(config.diagnostic_capacity));
        Self::with_registry(registry, config)
    }

    /// Creates an engine over an existing registry.
    ///
    /// The registry's error thresholds are set from `config`.
    pub fn with_registry(registry: Registry<C>, config: &EngineConfig) -> Self {
        {
            let mut counters = registry.counters();
            counters.set_instance_threshold(config.instance_error_threshold);
            counters.set_definition_threshold(config.definition_error_threshold);
        }
        Self {
            registry,
            deferred: Mutex::new(DeferredQueue::new()),
            default_group: config.default_group.clone(),
        }
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.registry
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        self.registry.diagnostics()
    }

    /// Subscribes to diagnostic events.
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics().subscribe()
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    // =========================================================================
    // Ticking
    // =========================================================================

    /// Advances one processing group by one tick.
    ///
    /// Failures in user code never escape this call; they are recorded as
    /// instance errors and reported on the diagnostic channel. Structural
    /// changes scheduled during the pass are applied before returning.
    pub fn update(&self, group: &str) -> TickSummary {
        let mut summary = TickSummary::new(group);

        let names = match self.registry.definition_names(group) {
            Some(names) if !group.trim().is_empty() => names,
            _ => {
                self.diagnostics().publish(
                    DiagnosticKind::UnknownGroup,
                    format!("update ignored, unknown processing group '{}'", group),
                    None,
                );
                return summary;
            }
        };

        for name in names {
            match self.registry.claim_tick(group, &name) {
                // Destroyed by a callback earlier in this tick
                TickClaim::Missing => {}
                TickClaim::Idle => summary.buckets_idle += 1,
                TickClaim::Throttled => summary.buckets_throttled += 1,
                TickClaim::Due(instances) => {
                    tracing::debug!(
                        group,
                        definition = name.as_str(),
                        instances = instances.len(),
                        "stepping bucket"
                    );
                    summary.buckets_stepped += 1;
                    for instance in &instances {
                        self.tick_instance(instance, &mut summary);
                    }
                }
            }
        }

        summary.deferred_applied = self.flush_deferred();
        summary
    }

    /// Advances the configured default group by one tick.
    pub fn update_default(&self) -> TickSummary {
        self.update(&self.default_group)
    }

    fn tick_instance(&self, instance: &Arc<Instance<C>>, summary: &mut TickSummary) {
        let Some(definition) = self.registry.resolve(instance.handle()) else {
            summary.instances_skipped += 1;
            return;
        };
        if !context_is_valid(instance.context().as_ref()) {
            summary.instances_skipped += 1;
            self.record_invalid_context(instance);
            return;
        }

        summary.instances_stepped += 1;
        match self.step(&definition, instance) {
            Ok(StepOutcome::Transitioned { .. }) => summary.transitions += 1,
            Ok(_) => {}
            Err(e) => {
                summary.failures += 1;
                self.record_instance_error(instance.handle(), "step failed", Some(e));
            }
        }
    }

    /// Steps one instance immediately, regardless of its bucket's process rate.
    ///
    /// Failures are recorded exactly as during `update`, and pending
    /// deferred operations are applied before returning.
    pub fn step_instance(&self, handle: &Handle) -> Result<StepOutcome, FsmError> {
        let (definition, instance) =
            self.registry
                .entry(handle)
                .ok_or_else(|| FsmError::InstanceNotFound {
                    instance: handle.to_string(),
                })?;

        let outcome = if !context_is_valid(instance.context().as_ref()) {
            self.record_invalid_context(&instance);
            StepOutcome::Failed
        } else {
            match self.step(&definition, &instance) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.record_instance_error(handle, "step failed", Some(e));
                    StepOutcome::Failed
                }
            }
        };

        self.flush_deferred();
        Ok(outcome)
    }

    /// Runs enter (once per state), update, transition selection, and exit.
    fn step(
        &self,
        definition: &Definition<C>,
        instance: &Instance<C>,
    ) -> Result<StepOutcome, FsmError> {
        let cursor = instance.cursor();
        let ctx = instance.context().as_ref();
        let state = definition
            .state(&cursor.state)
            .ok_or_else(|| FsmError::MissingState {
                definition: definition.name().to_string(),
                state: cursor.state.clone(),
            })?;

        if !cursor.entered {
            run_callback(state, Phase::Enter, ctx)?;
            instance.mark_entered(&cursor.state);
        }
        run_callback(state, Phase::Update, ctx)?;

        let Some(target) = select_transition(definition, &cursor.state, ctx)? else {
            return Ok(StepOutcome::Stayed);
        };
        if !definition.has_state(&target) {
            return Err(FsmError::MissingState {
                definition: definition.name().to_string(),
                state: target,
            });
        }

        run_callback(state, Phase::Exit, ctx)?;
        if !instance.move_from(&cursor.state, &target) {
            tracing::debug!(
                "{}: moved during callbacks, dropping {} -> {}",
                instance.handle(),
                cursor.state,
                target
            );
            return Ok(StepOutcome::Stayed);
        }
        tracing::trace!("{}: {} -> {}", instance.handle(), cursor.state, target);

        Ok(StepOutcome::Transitioned {
            from: cursor.state,
            to: target,
        })
    }

    /// Moves an instance to `target`, bypassing transition conditions.
    ///
    /// The current state's exit callback runs first if the state was entered.
    /// The target is entered on the instance's next step. Errors are returned
    /// to the caller and not counted against the instance.
    pub fn force_transition(&self, handle: &Handle, target: &str) -> Result<(), FsmError> {
        let (definition, instance) =
            self.registry
                .entry(handle)
                .ok_or_else(|| FsmError::InstanceNotFound {
                    instance: handle.to_string(),
                })?;
        if !definition.has_state(target) {
            return Err(FsmError::MissingState {
                definition: definition.name().to_string(),
                state: target.to_string(),
            });
        }

        let cursor = instance.cursor();
        if cursor.entered {
            if let Some(state) = definition.state(&cursor.state) {
                run_callback(state, Phase::Exit, instance.context().as_ref())?;
            }
        }
        instance.move_from(&cursor.state, target);
        tracing::debug!("{}: forced {} -> {}", handle, cursor.state, target);
        Ok(())
    }

    // =========================================================================
    // Degradation
    // =========================================================================

    /// Counts one failure against an instance.
    ///
    /// Removal scheduled by crossing the threshold is applied on the next
    /// flush (the end of the current or next `update`).
    pub fn record_instance_error(
        &self,
        handle: &Handle,
        message: &str,
        error: Option<FsmError>,
    ) -> u32 {
        let mut degradation = self.registry.counters();
        let mut deferred = self.deferred.lock();
        degradation.record_instance_error(handle, message, error, &mut deferred, self.diagnostics())
    }

    /// Counts one failure against a definition.
    pub fn record_definition_error(&self, definition: &str, group: &str) -> u32 {
        let mut degradation = self.registry.counters();
        let mut deferred = self.deferred.lock();
        degradation.record_definition_error(group, definition, &mut deferred, self.diagnostics())
    }

    fn record_invalid_context(&self, instance: &Instance<C>) {
        let name = instance.context().name().to_string();
        let mut degradation = self.registry.counters();
        let mut deferred = self.deferred.lock();
        degradation.record_invalid_context(
            instance.handle(),
            &name,
            &mut deferred,
            self.diagnostics(),
        );
    }

    pub fn instance_error_threshold(&self) -> u32 {
        self.registry.counters().instance_threshold()
    }

    pub fn set_instance_error_threshold(&self, threshold: u32) {
        self.registry.counters().set_instance_threshold(threshold);
    }

    pub fn definition_error_threshold(&self) -> u32 {
        self.registry.counters().definition_threshold()
    }

    pub fn set_definition_error_threshold(&self, threshold: u32) {
        self.registry.counters().set_definition_threshold(threshold);
    }

    pub fn instance_error_count(&self, handle: &Handle) -> u32 {
        self.registry.counters().instance_error_count(handle.id())
    }

    pub fn definition_error_count(&self, definition: &str, group: &str) -> u32 {
        self.registry
            .counters()
            .definition_error_count(group, definition)
    }

    pub fn reset_instance_error_count(&self, handle: &Handle) {
        self.registry
            .counters()
            .reset_instance_error_count(handle.id());
    }

    pub fn reset_definition_error_count(&self, definition: &str, group: &str) {
        self.registry
            .counters()
            .reset_definition_error_count(group, definition);
    }

    /// Clears every error counter.
    pub fn reset_all(&self) {
        self.registry.counters().reset_all();
    }

    // =========================================================================
    // Deferred modifications
    // =========================================================================

    /// Queues a structural change for the next flush.
    pub fn defer(&self, op: DeferredOp) {
        self.deferred.lock().push(op);
    }

    pub fn pending_deferred(&self) -> Vec<DeferredOp> {
        self.deferred.lock().pending()
    }

    /// Applies queued operations until the queue is empty.
    ///
    /// Each operation runs on its own; a failing operation is reported on
    /// the diagnostic channel and the rest still run. Operations queued while
    /// flushing are applied in the same flush. Returns the number applied.
    pub fn flush_deferred(&self) -> usize {
        let mut applied = 0;
        loop {
            let next = self.deferred.lock().pop();
            let Some(op) = next else {
                break;
            };

            let result = match catch_unwind(AssertUnwindSafe(|| self.apply(&op))) {
                Ok(result) => result,
                Err(payload) => Err(FsmError::Panicked {
                    site: op.as_str().to_string(),
                    message: panic_message(payload.as_ref()),
                }),
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => self.diagnostics().publish(
                    DiagnosticKind::DeferredFailed,
                    format!("deferred operation failed: {}", op),
                    Some(e),
                ),
            }
        }
        applied
    }

    fn apply(&self, op: &DeferredOp) -> Result<(), FsmError> {
        match op {
            DeferredOp::DestroyInstance(handle) => {
                if !self.destroy_instance(handle) {
                    tracing::debug!("{} already removed", handle);
                }
                Ok(())
            }
            DeferredOp::RecordDefinitionError { group, definition } => {
                if !self.registry.contains_definition(definition, group) {
                    tracing::debug!(
                        "skipping failure credit, '{}' in group '{}' is gone",
                        definition,
                        group
                    );
                    return Ok(());
                }
                self.record_definition_error(definition, group);
                Ok(())
            }
            DeferredOp::DestroyDefinition { group, definition } => self
                .destroy_definition(definition, group)
                .map(|_| ())
                .ok_or_else(|| FsmError::DefinitionNotFound {
                    group: group.clone(),
                    definition: definition.clone(),
                }),
        }
    }

    // =========================================================================
    // Destruction
    // =========================================================================

    /// Removes an instance and its error counter. Idempotent.
    pub fn destroy_instance(&self, handle: &Handle) -> bool {
        self.registry.destroy_instance(handle)
    }

    /// Removes a definition, its instances, and their counters.
    pub fn destroy_definition(&self, definition: &str, group: &str) -> Option<usize> {
        self.registry.destroy_definition(definition, group)
    }

    /// Removes a whole processing group.
    pub fn destroy_group(&self, group: &str) -> bool {
        self.registry.destroy_group(group)
    }
}

impl<C: Context> Default for Engine<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates wildcard transitions first, then the current state's own.
fn select_transition<C>(
    definition: &Definition<C>,
    current: &str,
    ctx: &C,
) -> Result<Option<String>, FsmError> {
    for transition in definition.wildcard_transitions() {
        // A wildcard never re-enters the state it targets
        if transition.to() == current {
            continue;
        }
        if evaluate(transition, ctx)? {
            return Ok(Some(transition.to().to_string()));
        }
    }
    for transition in definition.transitions_from(current) {
        if evaluate(transition, ctx)? {
            return Ok(Some(transition.to().to_string()));
        }
    }
    Ok(None)
}

fn evaluate<C>(transition: &Transition<C>, ctx: &C) -> Result<bool, FsmError> {
    guarded(
        || {
            format!(
                "condition '{}' -> '{}'",
                transition.from().as_str(),
                transition.to()
            )
        },
        || {
            transition
                .evaluate(ctx)
                .map_err(|source| FsmError::Condition {
                    from: transition.from().as_str().to_string(),
                    to: transition.to().to_string(),
                    source,
                })
        },
    )
}

fn run_callback<C>(state: &State<C>, phase: Phase, ctx: &C) -> Result<(), FsmError> {
    let Some(callback) = state.callback(phase) else {
        return Ok(());
    };
    guarded(
        || format!("{} callback of state '{}'", phase, state.name()),
        || {
            callback(ctx).map_err(|source| FsmError::Callback {
                state: state.name().to_string(),
                phase,
                source,
            })
        },
    )
}

/// Runs user code, turning a panic into [`FsmError::Panicked`].
fn guarded<T>(
    site: impl FnOnce() -> String,
    f: impl FnOnce() -> Result<T, FsmError>,
) -> Result<T, FsmError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(FsmError::Panicked {
            site: site(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// A context whose validity check panics is treated as invalid.
fn context_is_valid<C: Context>(ctx: &C) -> bool {
    catch_unwind(AssertUnwindSafe(|| ctx.is_valid())).unwrap_or(false)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TransitionBuilder;
    use crate::definition::ProcessRate;
    use crate::diagnostics::drain;
    use crate::testing::TestContext;
    use proptest::prelude::*;
    use std::num::NonZeroU32;
    use std::sync::Weak;

    const GROUP: &str = "ai";

    fn journaling(name: &str) -> State<TestContext> {
        let enter = format!("enter:{}", name);
        let update = format!("update:{}", name);
        let exit = format!("exit:{}", name);
        State::new(name)
            .on_enter(move |ctx: &TestContext| {
                ctx.record(enter.clone());
                Ok(())
            })
            .on_update(move |ctx: &TestContext| {
                ctx.record(update.clone());
                Ok(())
            })
            .on_exit(move |ctx: &TestContext| {
                ctx.record(exit.clone());
                Ok(())
            })
    }

    fn failing(name: &str) -> State<TestContext> {
        State::new(name).on_update(|_: &TestContext| Err("update exploded".into()))
    }

    fn light() -> Definition<TestContext> {
        Definition::builder("light")
            .state(journaling("off"))
            .state(journaling("on"))
            .initial("off")
            .on_condition("off", "on", |ctx: &TestContext| ctx.flag("is_on"))
            .on_condition("on", "off", |ctx: &TestContext| !ctx.flag("is_on"))
            .build()
            .unwrap()
    }

    fn setup(
        definition: Definition<TestContext>,
        rate: ProcessRate,
    ) -> (Engine<TestContext>, Arc<TestContext>, Handle) {
        let engine = Engine::new();
        let name = definition.name().to_string();
        engine
            .registry()
            .register_definition(&name, definition, rate, GROUP)
            .unwrap();
        let ctx = Arc::new(TestContext::new("subject"));
        let handle = engine
            .registry()
            .create_instance(&name, ctx.clone(), GROUP)
            .unwrap();
        (engine, ctx, handle)
    }

    #[test]
    fn test_first_tick_enters_and_updates_once() {
        let (engine, ctx, handle) = setup(light(), ProcessRate::EveryTick);

        let summary = engine.update(GROUP);

        assert_eq!(ctx.journal(), vec!["enter:off", "update:off"]);
        assert_eq!(summary.instances_stepped, 1);
        assert_eq!(summary.transitions, 0);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "off");
    }

    #[test]
    fn test_light_example() {
        let (engine, ctx, handle) = setup(light(), ProcessRate::EveryTick);

        engine.update(GROUP);
        assert_eq!(ctx.journal(), vec!["enter:off", "update:off"]);
        ctx.clear_journal();

        ctx.set_flag("is_on", true);
        let summary = engine.update(GROUP);
        assert_eq!(ctx.journal(), vec!["update:off", "exit:off"]);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "on");
        assert_eq!(summary.transitions, 1);
        ctx.clear_journal();

        engine.update(GROUP);
        assert_eq!(ctx.journal(), vec!["enter:on", "update:on"]);
    }

    #[test]
    fn test_instance_threshold_example() {
        let definition = Definition::builder("broken")
            .state(failing("idle"))
            .initial("idle")
            .build()
            .unwrap();
        let (engine, _ctx, handle) = setup(definition, ProcessRate::EveryTick);
        engine.set_instance_error_threshold(2);

        let first = engine.update(GROUP);
        assert_eq!(first.failures, 1);
        assert!(engine.registry().contains_instance(&handle));
        assert_eq!(engine.instance_error_count(&handle), 1);

        let second = engine.update(GROUP);
        assert_eq!(second.failures, 1);
        assert!(!engine.registry().contains_instance(&handle));
        assert_eq!(engine.definition_error_count("broken", GROUP), 1);
        assert!(engine.registry().contains_definition("broken", GROUP));
    }

    #[test]
    fn test_failure_is_isolated_to_instance() {
        let definition = Definition::builder("mixed")
            .state(State::new("idle").on_update(|ctx: &TestContext| {
                ctx.record("update");
                if ctx.flag("fail") {
                    return Err("bad".into());
                }
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        let engine: Engine<TestContext> = Engine::new();
        engine.registry().register(definition, GROUP).unwrap();

        let bad = Arc::new(TestContext::new("bad"));
        bad.set_flag("fail", true);
        let good = Arc::new(TestContext::new("good"));
        engine.registry().create_instance("mixed", bad.clone(), GROUP).unwrap();
        engine.registry().create_instance("mixed", good.clone(), GROUP).unwrap();

        let summary = engine.update(GROUP);
        assert_eq!(summary.instances_stepped, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(good.journal(), vec!["update"]);
    }

    #[test]
    fn test_zombie_instance_never_steps() {
        let engine: Engine<TestContext> = Engine::new();
        let weak = engine.registry().downgrade();
        let victim: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));

        let target = victim.clone();
        let definition = Definition::builder("npc")
            .state(State::new("idle").on_update(move |ctx: &TestContext| {
                ctx.record("update");
                if ctx.name() == "killer" {
                    if let (Some(registry), Some(handle)) = (weak.upgrade(), target.lock().clone()) {
                        registry.destroy_instance(&handle);
                    }
                }
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        engine.registry().register(definition, GROUP).unwrap();

        let killer = Arc::new(TestContext::new("killer"));
        let doomed = Arc::new(TestContext::new("doomed"));
        engine.registry().create_instance("npc", killer.clone(), GROUP).unwrap();
        let doomed_handle = engine
            .registry()
            .create_instance("npc", doomed.clone(), GROUP)
            .unwrap();
        *victim.lock() = Some(doomed_handle.clone());

        let summary = engine.update(GROUP);

        assert_eq!(killer.journal(), vec!["update"]);
        assert!(doomed.journal().is_empty());
        assert_eq!(summary.instances_skipped, 1);
        assert_eq!(summary.failures, 0);
        assert!(!engine.registry().contains_instance(&doomed_handle));
    }

    #[test]
    fn test_instances_created_mid_tick_wait_for_next_tick() {
        let engine: Engine<TestContext> = Engine::new();
        let weak = engine.registry().downgrade();
        let spawned = Arc::new(TestContext::new("spawned"));

        let child = spawned.clone();
        let definition = Definition::builder("spawner")
            .state(State::new("idle").on_update(move |ctx: &TestContext| {
                if ctx.name() == "parent" && !ctx.flag("spawned") {
                    ctx.set_flag("spawned", true);
                    if let Some(registry) = weak.upgrade() {
                        registry.create_instance("spawner", child.clone(), GROUP)?;
                    }
                }
                ctx.record("update");
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        engine.registry().register(definition, GROUP).unwrap();
        engine
            .registry()
            .create_instance("spawner", Arc::new(TestContext::new("parent")), GROUP)
            .unwrap();

        engine.update(GROUP);
        assert!(spawned.journal().is_empty());
        assert_eq!(engine.registry().instance_count(Some(GROUP)), 2);

        engine.update(GROUP);
        assert_eq!(spawned.journal(), vec!["update"]);
    }

    #[test]
    fn test_rate_n_steps_every_nth_tick() {
        let every3 = ProcessRate::Every(NonZeroU32::new(3).unwrap());
        let (engine, ctx, _) = setup(light(), every3);

        let mut stepped_on = Vec::new();
        for tick in 1..=7 {
            let summary = engine.update(GROUP);
            if summary.buckets_stepped == 1 {
                stepped_on.push(tick);
            } else {
                assert_eq!(summary.buckets_throttled, 1);
            }
        }

        assert_eq!(stepped_on, vec![3, 6]);
        assert_eq!(ctx.journal(), vec!["enter:off", "update:off", "update:off"]);
    }

    #[test]
    fn test_rate_zero_is_never_ticked() {
        let (engine, ctx, handle) = setup(light(), ProcessRate::Never);

        for _ in 0..5 {
            let summary = engine.update(GROUP);
            assert_eq!(summary.buckets_idle, 1);
        }
        assert!(ctx.journal().is_empty());

        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Stayed);
        assert_eq!(ctx.journal(), vec!["enter:off", "update:off"]);
    }

    #[test]
    fn test_redefinition_resets_counter() {
        let every2 = ProcessRate::Every(NonZeroU32::new(2).unwrap());
        let (engine, _ctx, _) = setup(light(), every2);

        assert_eq!(engine.update(GROUP).buckets_throttled, 1);
        engine
            .registry()
            .register_definition("light", light(), every2, GROUP)
            .unwrap();
        // Counter is back at 2, so the next tick is throttled again
        assert_eq!(engine.update(GROUP).buckets_throttled, 1);
        assert_eq!(engine.update(GROUP).buckets_stepped, 1);
    }

    #[test]
    fn test_wildcard_takes_precedence() {
        let definition = Definition::builder("npc")
            .state(journaling("idle"))
            .state(journaling("walk"))
            .state(journaling("stunned"))
            .initial("idle")
            .on_condition("idle", "walk", |_: &TestContext| true)
            .any_state("stunned", |ctx: &TestContext| ctx.flag("hit"))
            .build()
            .unwrap();
        let (engine, ctx, handle) = setup(definition, ProcessRate::EveryTick);
        ctx.set_flag("hit", true);

        let outcome = engine.step_instance(&handle).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Transitioned {
                from: "idle".into(),
                to: "stunned".into(),
            }
        );

        // Still hit: the wildcard does not re-fire into its own target
        ctx.clear_journal();
        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Stayed);
        assert_eq!(ctx.journal(), vec!["enter:stunned", "update:stunned"]);
    }

    #[test]
    fn test_transitions_evaluated_in_declaration_order() {
        let definition = Definition::builder("npc")
            .state(State::new("idle"))
            .state(State::new("a"))
            .state(State::new("b"))
            .initial("idle")
            .on_condition("idle", "b", |_: &TestContext| true)
            .on_condition("idle", "a", |_: &TestContext| true)
            .build()
            .unwrap();
        let (engine, _ctx, handle) = setup(definition, ProcessRate::EveryTick);

        engine.update(GROUP);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "b");
    }

    #[test]
    fn test_missing_target_state_is_a_failure() {
        let definition = Definition::builder("npc")
            .state(journaling("idle"))
            .initial("idle")
            .on_condition("idle", "ghost", |_: &TestContext| true)
            .build()
            .unwrap();
        let (engine, ctx, handle) = setup(definition, ProcessRate::EveryTick);
        let mut rx = engine.subscribe();

        let summary = engine.update(GROUP);

        assert_eq!(summary.failures, 1);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "idle");
        assert!(!ctx.journal().contains(&"exit:idle".to_string()));
        let failure = drain(&mut rx)
            .into_iter()
            .find(|d| d.kind == DiagnosticKind::InstanceFailed)
            .unwrap();
        assert_eq!(failure.error.unwrap().error_code(), "MISSING_STATE");
    }

    #[test]
    fn test_missing_initial_state_is_a_failure() {
        let definition = Definition::builder("npc")
            .state(State::new("idle"))
            .initial("nowhere")
            .build()
            .unwrap();
        let (engine, _ctx, handle) = setup(definition, ProcessRate::EveryTick);

        assert_eq!(engine.update(GROUP).failures, 1);
        assert_eq!(engine.instance_error_count(&handle), 1);
    }

    #[test]
    fn test_failed_enter_is_retried() {
        let definition = Definition::builder("npc")
            .state(
                State::new("idle")
                    .on_enter(|ctx: &TestContext| {
                        ctx.record("enter");
                        if !ctx.flag("ready") {
                            return Err("not ready".into());
                        }
                        Ok(())
                    })
                    .on_update(|ctx: &TestContext| {
                        ctx.record("update");
                        Ok(())
                    }),
            )
            .initial("idle")
            .build()
            .unwrap();
        let (engine, ctx, _) = setup(definition, ProcessRate::EveryTick);

        assert_eq!(engine.update(GROUP).failures, 1);
        assert_eq!(ctx.journal(), vec!["enter"]);

        ctx.set_flag("ready", true);
        engine.update(GROUP);
        engine.update(GROUP);
        assert_eq!(ctx.journal(), vec!["enter", "enter", "update", "update"]);
    }

    #[test]
    fn test_failed_exit_keeps_old_state() {
        let definition = Definition::builder("npc")
            .state(State::new("idle").on_exit(|_: &TestContext| Err("stuck".into())))
            .state(State::new("walk"))
            .initial("idle")
            .on_condition("idle", "walk", |_: &TestContext| true)
            .build()
            .unwrap();
        let (engine, _ctx, handle) = setup(definition, ProcessRate::EveryTick);

        assert_eq!(engine.update(GROUP).failures, 1);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "idle");
    }

    #[test]
    fn test_condition_error_and_panic_are_contained() {
        let definition = Definition::builder("npc")
            .state(State::new("idle"))
            .state(State::new("walk"))
            .state(State::new("panic"))
            .initial("idle")
            .transition(
                TransitionBuilder::new()
                    .from("idle")
                    .to("walk")
                    .try_when(|ctx: &TestContext| {
                        if ctx.flag("bad_guard") {
                            Err("guard error".into())
                        } else {
                            Ok(false)
                        }
                    }),
            )
            .on_condition("idle", "panic", |ctx: &TestContext| {
                if ctx.flag("explode") {
                    panic!("condition blew up");
                }
                false
            })
            .build()
            .unwrap();
        let (engine, ctx, handle) = setup(definition, ProcessRate::EveryTick);
        let mut rx = engine.subscribe();

        ctx.set_flag("bad_guard", true);
        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Failed);

        ctx.set_flag("bad_guard", false);
        ctx.set_flag("explode", true);
        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Failed);

        let codes: Vec<&str> = drain(&mut rx)
            .iter()
            .filter_map(|d| d.error.as_ref().map(|e| e.error_code()))
            .collect();
        assert_eq!(codes, vec!["CONDITION_FAILED", "PANICKED"]);
        assert_eq!(engine.instance_error_count(&handle), 2);
    }

    #[test]
    fn test_definition_cascade() {
        let definition = Definition::builder("npc")
            .state(State::new("idle").on_update(|ctx: &TestContext| {
                if ctx.flag("fail") {
                    return Err("bad".into());
                }
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        let engine: Engine<TestContext> = Engine::new();
        engine.set_instance_error_threshold(1);
        engine.set_definition_error_threshold(2);
        engine.registry().register(definition, GROUP).unwrap();

        let mut handles = Vec::new();
        for (name, fail) in [("a", true), ("b", true), ("c", false)] {
            let ctx = Arc::new(TestContext::new(name));
            ctx.set_flag("fail", fail);
            handles.push(engine.registry().create_instance("npc", ctx, GROUP).unwrap());
        }
        let mut rx = engine.subscribe();

        let summary = engine.update(GROUP);

        assert_eq!(summary.failures, 2);
        // destroy a, credit, destroy b, credit, destroy definition
        assert_eq!(summary.deferred_applied, 5);
        assert!(!engine.registry().contains_definition("npc", GROUP));
        assert!(handles.iter().all(|h| !engine.registry().contains_instance(h)));
        assert!(drain(&mut rx)
            .iter()
            .any(|d| d.kind == DiagnosticKind::DefinitionThreshold));

        let next = engine.update(GROUP);
        assert_eq!(next.buckets_stepped, 0);
    }

    #[test]
    fn test_invalid_context_is_removed() {
        let (engine, ctx, handle) = setup(light(), ProcessRate::EveryTick);
        let mut rx = engine.subscribe();
        ctx.invalidate();

        let summary = engine.update(GROUP);

        assert!(ctx.journal().is_empty());
        assert_eq!(summary.instances_skipped, 1);
        assert!(!engine.registry().contains_instance(&handle));
        let events = drain(&mut rx);
        assert_eq!(
            events[0].error.as_ref().unwrap().error_code(),
            "INVALID_CONTEXT"
        );
        assert!(events
            .iter()
            .any(|d| d.kind == DiagnosticKind::InstanceDestroyed));
    }

    #[test]
    fn test_redefinition_is_observed_on_next_step() {
        let v1 = Definition::builder("npc")
            .state(State::new("idle").on_update(|ctx: &TestContext| {
                ctx.record("v1");
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        let v2 = Definition::builder("npc")
            .state(State::new("idle").on_update(|ctx: &TestContext| {
                ctx.record("v2");
                Ok(())
            }))
            .initial("idle")
            .build()
            .unwrap();
        let (engine, ctx, _) = setup(v1, ProcessRate::EveryTick);
        let mut rx = engine.subscribe();

        engine.update(GROUP);
        engine.registry().register(v2, GROUP).unwrap();
        engine.update(GROUP);

        assert_eq!(ctx.journal(), vec!["v1", "v2"]);
        assert_eq!(drain(&mut rx)[0].kind, DiagnosticKind::Redefined);
    }

    #[test]
    fn test_unknown_or_blank_group_is_reported() {
        let engine: Engine<TestContext> = Engine::new();
        let mut rx = engine.subscribe();

        assert_eq!(engine.update("nope"), TickSummary::new("nope"));
        engine.update("  ");
        engine.update_default();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|d| d.kind == DiagnosticKind::UnknownGroup));
    }

    #[test]
    fn test_update_default_uses_configured_group() {
        let config = EngineConfig {
            default_group: "world".to_string(),
            ..EngineConfig::default()
        };
        let engine: Engine<TestContext> = Engine::with_config(&config);
        engine.registry().register(light(), "world").unwrap();
        let ctx = Arc::new(TestContext::new("lamp"));
        engine.registry().create_instance("light", ctx.clone(), "world").unwrap();

        assert_eq!(engine.update_default().group, "world");
        assert_eq!(ctx.journal(), vec!["enter:off", "update:off"]);
    }

    #[test]
    fn test_step_instance_unknown_handle() {
        let (engine, _ctx, handle) = setup(light(), ProcessRate::EveryTick);
        engine.destroy_instance(&handle);

        assert!(matches!(
            engine.step_instance(&handle),
            Err(FsmError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_force_transition() {
        let (engine, ctx, handle) = setup(light(), ProcessRate::EveryTick);

        // Not entered yet, so no exit
        engine.force_transition(&handle, "on").unwrap();
        assert!(ctx.journal().is_empty());
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "on");

        ctx.set_flag("is_on", true);
        engine.update(GROUP);
        engine.force_transition(&handle, "off").unwrap();
        assert_eq!(ctx.journal(), vec!["enter:on", "update:on", "exit:on"]);

        assert!(matches!(
            engine.force_transition(&handle, "ghost"),
            Err(FsmError::MissingState { .. })
        ));
    }

    #[test]
    fn test_deferred_failure_does_not_stop_queue() {
        let (engine, _ctx, handle) = setup(light(), ProcessRate::EveryTick);
        let mut rx = engine.subscribe();

        engine.defer(DeferredOp::DestroyDefinition {
            group: GROUP.into(),
            definition: "missing".into(),
        });
        engine.defer(DeferredOp::DestroyInstance(handle.clone()));
        assert_eq!(engine.pending_deferred().len(), 2);

        assert_eq!(engine.flush_deferred(), 1);
        assert!(!engine.registry().contains_instance(&handle));
        let events = drain(&mut rx);
        assert_eq!(events[0].kind, DiagnosticKind::DeferredFailed);
        assert_eq!(
            events[0].error.as_ref().unwrap().error_code(),
            "DEFINITION_NOT_FOUND"
        );
    }

    #[test]
    fn test_manual_error_recording_and_resets() {
        let (engine, _ctx, handle) = setup(light(), ProcessRate::EveryTick);

        assert_eq!(engine.record_instance_error(&handle, "manual", None), 1);
        assert_eq!(engine.record_definition_error("light", GROUP), 1);

        engine.reset_instance_error_count(&handle);
        assert_eq!(engine.instance_error_count(&handle), 0);
        engine.reset_definition_error_count("light", GROUP);
        assert_eq!(engine.definition_error_count("light", GROUP), 0);

        engine.record_instance_error(&handle, "manual", None);
        engine.reset_all();
        assert_eq!(engine.instance_error_count(&handle), 0);
        assert!(engine.pending_deferred().is_empty());
    }

    #[test]
    fn test_registry_destroy_drops_counters() {
        let (engine, _ctx, handle) = setup(light(), ProcessRate::EveryTick);

        engine.record_instance_error(&handle, "manual", None);
        engine.record_definition_error("light", GROUP);
        engine.record_definition_error("light", GROUP);

        assert!(engine.registry().destroy_instance(&handle));
        assert_eq!(engine.instance_error_count(&handle), 0);
        assert_eq!(engine.registry().destroy_definition("light", GROUP), Some(0));
        assert_eq!(engine.definition_error_count("light", GROUP), 0);

        // A fresh definition under the old name starts from zero
        engine.registry().register(light(), GROUP).unwrap();
        assert_eq!(engine.record_definition_error("light", GROUP), 1);
        engine.flush_deferred();
        assert!(engine.registry().contains_definition("light", GROUP));

        let handle = engine
            .registry()
            .create_instance("light", Arc::new(TestContext::new("again")), GROUP)
            .unwrap();
        engine.record_instance_error(&handle, "manual", None);
        let weak = engine.registry().downgrade();
        assert!(weak.upgrade().unwrap().destroy_group(GROUP));
        assert_eq!(engine.instance_error_count(&handle), 0);
        assert_eq!(engine.definition_error_count("light", GROUP), 0);
    }

    #[test]
    fn test_instance_moved_by_its_own_callback_stays() {
        let engine: Arc<Engine<TestContext>> = Arc::new(Engine::new());
        let slot: Arc<Mutex<Option<(Weak<Engine<TestContext>>, Handle)>>> =
            Arc::new(Mutex::new(None));

        let target = slot.clone();
        let definition = Definition::builder("npc")
            .state(State::new("idle").on_update(move |ctx: &TestContext| {
                if ctx.flag("stun") {
                    ctx.set_flag("stun", false);
                    let bound = target.lock().clone();
                    if let Some((weak, handle)) = bound {
                        if let Some(engine) = weak.upgrade() {
                            engine.force_transition(&handle, "stunned")?;
                        }
                    }
                }
                Ok(())
            }))
            .state(State::new("walk"))
            .state(State::new("stunned"))
            .initial("idle")
            .on_condition("idle", "walk", |ctx: &TestContext| ctx.flag("move"))
            .build()
            .unwrap();
        engine.registry().register(definition, GROUP).unwrap();
        let ctx = Arc::new(TestContext::new("npc-1"));
        let handle = engine
            .registry()
            .create_instance("npc", ctx.clone(), GROUP)
            .unwrap();
        *slot.lock() = Some((Arc::downgrade(&engine), handle.clone()));

        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Stayed);

        ctx.set_flag("stun", true);
        ctx.set_flag("move", true);
        assert_eq!(engine.step_instance(&handle).unwrap(), StepOutcome::Stayed);
        assert_eq!(engine.registry().current_state(&handle).unwrap(), "stunned");
        assert_eq!(engine.instance_error_count(&handle), 0);
    }

    #[test]
    fn test_thresholds_from_config() {
        let config = EngineConfig {
            instance_error_threshold: 7,
            definition_error_threshold: 1,
            ..EngineConfig::default()
        };
        let engine: Engine<TestContext> = Engine::with_config(&config);
        assert_eq!(engine.instance_error_threshold(), 7);
        assert_eq!(engine.definition_error_threshold(), 1);
    }

    #[test]
    fn test_engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine<TestContext>>();
    }

    proptest! {
        #[test]
        fn prop_rate_n_steps_once_per_window(rate in 1u32..12, ticks in 0usize..60) {
            let every = ProcessRate::Every(NonZeroU32::new(rate).unwrap());
            let (engine, _ctx, _) = setup(light(), every);

            let mut stepped = 0;
            for _ in 0..ticks {
                stepped += engine.update(GROUP).buckets_stepped;
            }
            prop_assert_eq!(stepped, ticks / rate as usize);
        }
    }
}
