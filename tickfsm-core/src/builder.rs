//! Fluent construction of definitions and transitions.
//!
//! ```
//! use tickfsm_core::{Context, Definition, State};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! struct Lamp {
//!     on: AtomicBool,
//! }
//!
//! impl Context for Lamp {
//!     fn is_valid(&self) -> bool {
//!         true
//!     }
//!     fn name(&self) -> &str {
//!         "lamp"
//!     }
//! }
//!
//! let light = Definition::<Lamp>::builder("light")
//!     .state(State::new("off"))
//!     .state(State::new("on"))
//!     .initial("off")
//!     .on_condition("off", "on", |lamp: &Lamp| lamp.on.load(Ordering::Relaxed))
//!     .on_condition("on", "off", |lamp: &Lamp| !lamp.on.load(Ordering::Relaxed))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(light.initial(), "off");
//! ```

use crate::definition::{Condition, Definition, ProcessRate, State, Transition, TransitionSource};
use crate::error::{BuildError, CallbackError};
use std::collections::HashMap;
use std::sync::Arc;

/// Builder for a single transition.
pub struct TransitionBuilder<C> {
    from: Option<TransitionSource>,
    to: Option<String>,
    condition: Option<Condition<C>>,
}

impl<C: 'static> TransitionBuilder<C> {
    pub fn new() -> Self {
        Self {
            from: None,
            to: None,
            condition: None,
        }
    }

    /// Set the source state (required unless `from_any` is used).
    pub fn from(mut self, state: impl Into<String>) -> Self {
        self.from = Some(TransitionSource::State(state.into()));
        self
    }

    /// Make this a wildcard transition.
    pub fn from_any(mut self) -> Self {
        self.from = Some(TransitionSource::Any);
        self
    }

    /// Set the target state (required).
    pub fn to(mut self, state: impl Into<String>) -> Self {
        self.to = Some(state.into());
        self
    }

    /// Set an infallible condition (required).
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(move |ctx: &C| Ok(condition(ctx))));
        self
    }

    /// Set a condition that may fail; a failure counts against the instance.
    pub fn try_when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&C) -> Result<bool, CallbackError> + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Build the transition.
    /// Returns an error if the source, target, or condition is missing.
    pub fn build(self) -> Result<Transition<C>, BuildError> {
        let from = self.from.ok_or(BuildError::MissingSource)?;
        let to = self.to.ok_or(BuildError::MissingTarget)?;
        let condition = self
            .condition
            .ok_or_else(|| BuildError::MissingCondition { to: to.clone() })?;
        Ok(Transition::from_parts(from, to, condition))
    }
}

impl<C: 'static> Default for TransitionBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a [`Definition`].
///
/// Validation happens in [`build`](DefinitionBuilder::build): a blank name,
/// a missing initial state, duplicate or blank state names, and incomplete
/// transitions are rejected. Whether transition endpoints exist is left to
/// step time.
pub struct DefinitionBuilder<C> {
    name: String,
    states: Vec<State<C>>,
    transitions: Vec<TransitionBuilder<C>>,
    initial: Option<String>,
    process_rate: ProcessRate,
}

impl<C: 'static> DefinitionBuilder<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            process_rate: ProcessRate::default(),
        }
    }

    /// Add a state.
    pub fn state(mut self, state: State<C>) -> Self {
        self.states.push(state);
        self
    }

    /// Set the initial state (required).
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Set the desired process rate (defaults to every tick).
    pub fn process_rate(mut self, rate: ProcessRate) -> Self {
        self.process_rate = rate;
        self
    }

    /// Add a transition using a builder.
    pub fn transition(mut self, builder: TransitionBuilder<C>) -> Self {
        self.transitions.push(builder);
        self
    }

    /// Add a pre-built transition.
    pub fn add_transition(mut self, transition: Transition<C>) -> Self {
        let builder = TransitionBuilder {
            from: Some(transition.from().clone()),
            to: Some(transition.to().to_string()),
            condition: Some(transition.condition().clone()),
        };
        self.transitions.push(builder);
        self
    }

    /// Shorthand for a guarded `from -> to` transition.
    pub fn on_condition<F>(self, from: impl Into<String>, to: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.transition(TransitionBuilder::new().from(from).to(to).when(condition))
    }

    /// Shorthand for a wildcard transition into `to`.
    pub fn any_state<F>(self, to: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.transition(TransitionBuilder::new().from_any().to(to).when(condition))
    }

    /// Build the definition.
    pub fn build(self) -> Result<Definition<C>, BuildError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(BuildError::MissingName);
        }

        let initial = self
            .initial
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BuildError::MissingInitialState {
                definition: name.clone(),
            })?;

        let mut states = HashMap::with_capacity(self.states.len());
        for state in self.states {
            if state.name().trim().is_empty() {
                return Err(BuildError::BlankStateName);
            }
            if states.contains_key(state.name()) {
                return Err(BuildError::DuplicateState {
                    definition: name,
                    state: state.name().to_string(),
                });
            }
            states.insert(state.name().to_string(), state);
        }

        let mut transitions: HashMap<String, Vec<Transition<C>>> = HashMap::new();
        let mut wildcards: Vec<Transition<C>> = Vec::new();
        for builder in self.transitions {
            let transition = builder.build()?;
            let slot = match transition.from() {
                TransitionSource::Any => &mut wildcards,
                TransitionSource::State(from) => transitions.entry(from.clone()).or_default(),
            };
            // A later declaration for the same (from, to) replaces the earlier
            // condition but keeps its evaluation position.
            match slot.iter_mut().find(|t| t.to() == transition.to()) {
                Some(existing) => *existing = transition,
                None => slot.push(transition),
            }
        }

        Ok(Definition::from_parts(
            name,
            states,
            transitions,
            wildcards,
            initial,
            self.process_rate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn builder_validates_required_fields() {
        let result = DefinitionBuilder::<TestContext>::new("  ").build();
        assert!(matches!(result, Err(BuildError::MissingName)));

        let result = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new("idle"))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingInitialState { .. })
        ));
    }

    #[test]
    fn builder_rejects_duplicate_states() {
        let result = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new("idle"))
            .state(State::new("idle"))
            .initial("idle")
            .build();

        assert_eq!(
            result.unwrap_err(),
            BuildError::DuplicateState {
                definition: "npc".to_string(),
                state: "idle".to_string(),
            }
        );
    }

    #[test]
    fn builder_rejects_blank_state_name() {
        let result = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new(""))
            .initial("idle")
            .build();
        assert!(matches!(result, Err(BuildError::BlankStateName)));
    }

    #[test]
    fn transition_requires_condition() {
        let result = TransitionBuilder::<TestContext>::new()
            .from("idle")
            .to("walk")
            .build();
        assert_eq!(
            result.unwrap_err(),
            BuildError::MissingCondition {
                to: "walk".to_string()
            }
        );

        let result = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new("idle"))
            .initial("idle")
            .transition(TransitionBuilder::new().from("idle").to("walk"))
            .build();
        assert!(matches!(result, Err(BuildError::MissingCondition { .. })));
    }

    #[test]
    fn transition_requires_endpoints() {
        let result = TransitionBuilder::<TestContext>::new()
            .to("walk")
            .when(|_| true)
            .build();
        assert!(matches!(result, Err(BuildError::MissingSource)));

        let result = TransitionBuilder::<TestContext>::new()
            .from("idle")
            .when(|_| true)
            .build();
        assert!(matches!(result, Err(BuildError::MissingTarget)));
    }

    #[test]
    fn undeclared_states_are_accepted_at_build_time() {
        let def = DefinitionBuilder::<TestContext>::new("npc")
            .initial("ghost")
            .on_condition("ghost", "phantom", |_| true)
            .build()
            .unwrap();

        assert_eq!(def.initial(), "ghost");
        assert!(!def.has_state("ghost"));
        assert!(def.transition("ghost", "phantom").is_some());
    }

    #[test]
    fn redeclared_transition_replaces_condition_in_place() {
        let def = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new("idle"))
            .initial("idle")
            .on_condition("idle", "walk", |_| false)
            .on_condition("idle", "run", |_| false)
            .on_condition("idle", "walk", |_| true)
            .build()
            .unwrap();

        let ctx = TestContext::new("bob");
        let transitions = def.transitions_from("idle");
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to(), "walk");
        assert!(transitions[0].evaluate(&ctx).unwrap());
    }

    #[test]
    fn fallible_condition_and_prebuilt_transition() {
        let def = DefinitionBuilder::<TestContext>::new("npc")
            .state(State::new("idle"))
            .initial("idle")
            .transition(
                TransitionBuilder::new()
                    .from_any()
                    .to("dead")
                    .try_when(|_| Err("no health data".into())),
            )
            .add_transition(Transition::new("idle", "walk", |_: &TestContext| true))
            .process_rate(ProcessRate::Never)
            .build()
            .unwrap();

        let ctx = TestContext::new("bob");
        assert!(def.wildcard_transitions()[0].evaluate(&ctx).is_err());
        assert!(def.transition("idle", "walk").unwrap().evaluate(&ctx).unwrap());
        assert_eq!(def.process_rate(), ProcessRate::Never);
    }
}
