//! Declarative machine documents.
//!
//! Machines are written in YAML (or JSON, which YAML accepts):
//!
//! ```yaml
//! name: light
//! process_rate: -1
//! initial: "off"
//! states:
//!   - name: "off"
//!     on_enter: { set: { lamp: dark } }
//!   - name: "on"
//!     on_enter: { set: { lamp: lit } }
//! transitions:
//!   - { from: "off", to: "on", guard: "ctx.switch" }
//!   - { from: "on", to: "off", guard: "!ctx.switch" }
//!   - { from: "*", to: broken, guard: "ctx.voltage > 240" }
//! ```
//!
//! `from` takes one state or a list, and `"*"` for any state. A transition
//! without a guard always fires. State actions run in order: `set` merges
//! into the context, `invalidate` marks it invalid, and `fail` makes the
//! callback return an error with the given message.

use crate::context::JsonContext;
use crate::error::DslError;
use crate::guard::Guard;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tickfsm_core::{
    CallbackError, Definition, ProcessRate, Registration, Registry, State, TransitionBuilder,
    TransitionSource, ANY_STATE,
};

/// Declarative callback body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Action {
    /// Keys merged into the context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub set: Map<String, Value>,
    /// Marks the context invalid.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub invalidate: bool,
    /// Makes the callback fail with this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
}

impl Action {
    fn into_callback(self) -> impl Fn(&JsonContext) -> Result<(), CallbackError> + Send + Sync {
        move |ctx: &JsonContext| {
            if !self.set.is_empty() {
                ctx.merge(&self.set);
            }
            if self.invalidate {
                ctx.invalidate();
            }
            match &self.fail {
                Some(message) => Err(message.clone().into()),
                None => Ok(()),
            }
        }
    }
}

/// A state and its optional actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_enter: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<Action>,
}

/// A guarded transition from one or more source states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionSpec {
    #[serde(deserialize_with = "one_or_many")]
    pub from: Vec<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(state) => vec![state],
        OneOrMany::Many(states) => states,
    })
}

/// Raw machine document as written on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDocument {
    pub name: String,
    #[serde(default)]
    pub process_rate: ProcessRate,
    pub initial: String,
    pub states: Vec<StateSpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
    /// Free-form metadata, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl MachineDocument {
    pub fn from_yaml(source: &str) -> Result<Self, DslError> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json(value: &Value) -> Result<Self, DslError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Reads a YAML or JSON document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DslError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| DslError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    pub fn to_yaml(&self) -> Result<String, DslError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// CRC32C of the canonical JSON form, as 8 hex digits.
    pub fn checksum(&self) -> Result<String, DslError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:08x}", crc32c::crc32c(&bytes)))
    }

    /// Checks everything that can be checked without running the machine.
    ///
    /// Rejects a blank name, an empty state list, duplicate or blank state
    /// names, blank transition endpoints, and guards that do not parse.
    pub fn validate(&self) -> Result<(), DslError> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(DslError::machine(name, "name must not be blank"));
        }
        if self.states.is_empty() {
            return Err(DslError::machine(name, "at least one state is required"));
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if state.name.trim().is_empty() {
                return Err(DslError::machine(name, "state name must not be blank"));
            }
            if state.name == ANY_STATE {
                return Err(DslError::machine(name, "'*' is reserved for wildcard sources"));
            }
            if !seen.insert(state.name.as_str()) {
                return Err(DslError::machine(
                    name,
                    format!("duplicate state '{}'", state.name),
                ));
            }
        }

        for (index, transition) in self.transitions.iter().enumerate() {
            if transition.from.is_empty() || transition.from.iter().any(|s| s.trim().is_empty()) {
                return Err(DslError::machine(
                    name,
                    format!("transition #{} has a blank source", index + 1),
                ));
            }
            if transition.to.trim().is_empty() {
                return Err(DslError::machine(
                    name,
                    format!("transition #{} has a blank target", index + 1),
                ));
            }
            if let Some(guard) = &transition.guard {
                Guard::parse(guard)?;
            }
        }
        Ok(())
    }

    /// State names referenced by `initial` or a transition but never declared.
    ///
    /// These are not load errors; an instance that reaches one fails at step time.
    pub fn undeclared_states(&self) -> Vec<String> {
        let declared: HashSet<&str> = self.states.iter().map(|s| s.name.as_str()).collect();
        let referenced = std::iter::once(self.initial.as_str())
            .chain(self.transitions.iter().flat_map(|t| {
                t.from
                    .iter()
                    .map(String::as_str)
                    .filter(|s| *s != ANY_STATE)
                    .chain(std::iter::once(t.to.as_str()))
            }));

        referenced
            .filter(|s| !declared.contains(s))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Validates the document and builds an engine definition from it.
    pub fn compile(&self) -> Result<Definition<JsonContext>, DslError> {
        self.validate()?;

        let mut builder = Definition::builder(self.name.as_str())
            .initial(self.initial.as_str())
            .process_rate(self.process_rate);

        for spec in &self.states {
            let mut state = State::new(spec.name.as_str());
            if let Some(action) = &spec.on_enter {
                state = state.on_enter(action.clone().into_callback());
            }
            if let Some(action) = &spec.on_update {
                state = state.on_update(action.clone().into_callback());
            }
            if let Some(action) = &spec.on_exit {
                state = state.on_exit(action.clone().into_callback());
            }
            builder = builder.state(state);
        }

        for spec in &self.transitions {
            let guard = spec.guard.as_deref().map(Guard::parse).transpose()?.map(Arc::new);
            for from in &spec.from {
                let transition = match TransitionSource::parse(from) {
                    TransitionSource::Any => TransitionBuilder::new().from_any(),
                    TransitionSource::State(state) => TransitionBuilder::new().from(state),
                };
                let transition = match guard.clone() {
                    Some(guard) => transition
                        .when(move |ctx: &JsonContext| ctx.with_data(|data| guard.evaluate(data))),
                    None => transition.when(|_: &JsonContext| true),
                };
                builder = builder.transition(transition.to(spec.to.as_str()));
            }
        }

        let definition = builder.build()?;
        tracing::debug!(
            machine = definition.name(),
            states = self.states.len(),
            transitions = definition.transition_count(),
            "compiled machine document"
        );
        Ok(definition)
    }

    /// Compiles the document and registers it under its own name and rate.
    pub fn register(
        &self,
        registry: &Registry<JsonContext>,
        group: &str,
    ) -> Result<Registration, DslError> {
        let definition = self.compile()?;
        Ok(registry.register(definition, group)?)
    }
}
