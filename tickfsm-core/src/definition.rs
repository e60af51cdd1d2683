//! State machine definition types.
//!
//! A [`Definition`] is the shared blueprint many instances are stepped
//! against. Definitions are built with [`DefinitionBuilder`](crate::DefinitionBuilder)
//! and are immutable once built; re-registering under the same name swaps
//! the whole object.
//!
//! State names referenced by the initial state or by transitions are not
//! checked against the declared states here. A missing state surfaces when
//! an instance actually reaches it during a step.

use crate::error::{CallbackError, FsmError, Phase};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Sentinel source name for wildcard ("any state") transitions.
pub const ANY_STATE: &str = "*";

/// Callback run on state entry, update, or exit.
pub type StateCallback<C> = Arc<dyn Fn(&C) -> Result<(), CallbackError> + Send + Sync>;

/// Transition predicate over the context.
pub type Condition<C> = Arc<dyn Fn(&C) -> Result<bool, CallbackError> + Send + Sync>;

/// How often a bucket's instances are stepped by `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ProcessRate {
    /// Stepped on every tick (raw value -1).
    #[default]
    EveryTick,
    /// Never stepped by `update`; event-driven only (raw value 0).
    Never,
    /// Stepped on every Nth tick (raw value N).
    Every(NonZeroU32),
}

impl ProcessRate {
    /// Returns the raw integer form (-1, 0, or N).
    pub fn as_raw(&self) -> i32 {
        match self {
            ProcessRate::EveryTick => -1,
            ProcessRate::Never => 0,
            ProcessRate::Every(n) => i32::try_from(n.get()).unwrap_or(i32::MAX),
        }
    }

    /// Number of ticks between steps, or None when never auto-stepped.
    pub(crate) fn period(&self) -> Option<u32> {
        match self {
            ProcessRate::EveryTick => Some(1),
            ProcessRate::Never => None,
            ProcessRate::Every(n) => Some(n.get()),
        }
    }
}

impl TryFrom<i32> for ProcessRate {
    type Error = FsmError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            -1 => Ok(ProcessRate::EveryTick),
            0 => Ok(ProcessRate::Never),
            n if n > 0 => Ok(ProcessRate::Every(
                NonZeroU32::new(n as u32).ok_or_else(|| FsmError::invalid_argument("zero rate"))?,
            )),
            n => Err(FsmError::invalid_argument(format!(
                "process rate must be -1, 0 or positive, got {}",
                n
            ))),
        }
    }
}

impl From<ProcessRate> for i32 {
    fn from(rate: ProcessRate) -> Self {
        rate.as_raw()
    }
}

impl fmt::Display for ProcessRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRate::EveryTick => f.write_str("every tick"),
            ProcessRate::Never => f.write_str("event-driven"),
            ProcessRate::Every(n) => write!(f, "every {} ticks", n),
        }
    }
}

/// A named state with optional lifecycle callbacks.
pub struct State<C> {
    name: String,
    on_enter: Option<StateCallback<C>>,
    on_update: Option<StateCallback<C>>,
    on_exit: Option<StateCallback<C>>,
}

impl<C> State<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_enter: None,
            on_update: None,
            on_exit: None,
        }
    }

    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&C) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the callback registered for a phase, if any.
    pub fn callback(&self, phase: Phase) -> Option<&StateCallback<C>> {
        match phase {
            Phase::Enter => self.on_enter.as_ref(),
            Phase::Update => self.on_update.as_ref(),
            Phase::Exit => self.on_exit.as_ref(),
        }
    }
}

impl<C> Clone for State<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            on_enter: self.on_enter.clone(),
            on_update: self.on_update.clone(),
            on_exit: self.on_exit.clone(),
        }
    }
}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("on_enter", &self.on_enter.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .finish()
    }
}

/// Source of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransitionSource {
    /// Fires only from the named state.
    State(String),
    /// Fires from every state.
    Any,
}

impl TransitionSource {
    /// Parses a source name, mapping [`ANY_STATE`] to the wildcard.
    pub fn parse(name: &str) -> Self {
        if name == ANY_STATE {
            TransitionSource::Any
        } else {
            TransitionSource::State(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransitionSource::State(name) => name,
            TransitionSource::Any => ANY_STATE,
        }
    }
}

/// A guarded edge between two states.
pub struct Transition<C> {
    from: TransitionSource,
    to: String,
    condition: Condition<C>,
}

impl<C> Transition<C> {
    /// Creates a transition with an infallible condition.
    pub fn new<F>(from: impl Into<String>, to: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(
            TransitionSource::State(from.into()),
            to.into(),
            Arc::new(move |ctx: &C| Ok(condition(ctx))),
        )
    }

    /// Creates a wildcard transition that may fire from any state.
    pub fn any<F>(to: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(
            TransitionSource::Any,
            to.into(),
            Arc::new(move |ctx: &C| Ok(condition(ctx))),
        )
    }

    pub(crate) fn from_parts(from: TransitionSource, to: String, condition: Condition<C>) -> Self {
        Self {
            from,
            to,
            condition,
        }
    }

    pub fn from(&self) -> &TransitionSource {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn is_wildcard(&self) -> bool {
        self.from == TransitionSource::Any
    }

    pub(crate) fn condition(&self) -> &Condition<C> {
        &self.condition
    }

    /// Evaluates the condition against a context.
    pub fn evaluate(&self, ctx: &C) -> Result<bool, CallbackError> {
        (self.condition)(ctx)
    }
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        Self {
            from: self.from.clone(),
            to: self.to.clone(),
            condition: self.condition.clone(),
        }
    }
}

impl<C> fmt::Debug for Transition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from.as_str())
            .field("to", &self.to)
            .finish()
    }
}

/// Validated blueprint shared by all instances of one bucket.
pub struct Definition<C> {
    name: String,
    states: HashMap<String, State<C>>,
    /// Transitions per source state, in declaration order. At most one per (from, to).
    transitions: HashMap<String, Vec<Transition<C>>>,
    /// Wildcard transitions, in declaration order.
    wildcards: Vec<Transition<C>>,
    initial: String,
    process_rate: ProcessRate,
}

impl<C> Definition<C> {
    pub(crate) fn from_parts(
        name: String,
        states: HashMap<String, State<C>>,
        transitions: HashMap<String, Vec<Transition<C>>>,
        wildcards: Vec<Transition<C>>,
        initial: String,
        process_rate: ProcessRate,
    ) -> Self {
        Self {
            name,
            states,
            transitions,
            wildcards,
            initial,
            process_rate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    /// Desired process rate declared by the builder.
    pub fn process_rate(&self) -> ProcessRate {
        self.process_rate
    }

    pub fn state(&self, name: &str) -> Option<&State<C>> {
        self.states.get(name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Returns all state names, sorted.
    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Transitions declared for a source state, in declaration order.
    pub fn transitions_from(&self, state: &str) -> &[Transition<C>] {
        self.transitions
            .get(state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Looks up the transition for a (from, to) pair.
    pub fn transition(&self, from: &str, to: &str) -> Option<&Transition<C>> {
        self.transitions_from(from).iter().find(|t| t.to() == to)
    }

    pub fn wildcard_transitions(&self) -> &[Transition<C>] {
        &self.wildcards
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.values().map(Vec::len).sum::<usize>() + self.wildcards.len()
    }
}

impl<C: 'static> Definition<C> {
    /// Starts a builder for a definition with the given name.
    pub fn builder(name: impl Into<String>) -> crate::builder::DefinitionBuilder<C> {
        crate::builder::DefinitionBuilder::new(name)
    }
}

impl<C> fmt::Debug for Definition<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("states", &self.state_names())
            .field("transitions", &self.transition_count())
            .field("initial", &self.initial)
            .field("process_rate", &self.process_rate)
            .finish()
    }
}
