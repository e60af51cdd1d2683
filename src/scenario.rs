//! Scenario files: machines, instances, and scripted context changes.
//!
//! ```yaml
//! ticks: 5
//! machines:
//!   - path: light.yaml        # relative to the scenario file
//!     group: world
//!   - group: world
//!     process_rate: 2         # overrides the document's rate
//!     inline:
//!       name: blinker
//!       initial: a
//!       states: [{ name: a }, { name: b }]
//!       transitions: [{ from: a, to: b }, { from: b, to: a }]
//! instances:
//!   - { name: porch, machine: light, group: world, ctx: { switch: false } }
//! events:
//!   - { tick: 2, instance: porch, set: { switch: true } }
//! ```

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tickfsm_core::{ConfigError, Engine, EngineConfig, FsmError, Handle, ProcessRate, TickSummary};
use tickfsm_dsl::{DslError, JsonContext, MachineDocument};

/// Errors loading or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error(transparent)]
    Dsl(#[from] DslError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Where a machine document comes from, and where it is registered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineEntry {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub inline: Option<MachineDocument>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub process_rate: Option<ProcessRate>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceEntry {
    pub name: String,
    pub machine: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub ctx: Value,
}

/// Context change applied just before the given tick (1-based).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEntry {
    pub tick: u32,
    pub instance: String,
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub invalidate: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub ticks: Option<u32>,
    pub machines: Vec<MachineEntry>,
    #[serde(default)]
    pub instances: Vec<InstanceEntry>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
    /// Directory machine paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Scenario {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut scenario = Self::from_yaml(&content)?;
        scenario.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(scenario)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(content)?)
    }

    fn document(&self, entry: &MachineEntry) -> Result<MachineDocument, ScenarioError> {
        match (&entry.path, &entry.inline) {
            (Some(path), None) => Ok(MachineDocument::from_path(self.base_dir.join(path))?),
            (None, Some(doc)) => Ok(doc.clone()),
            _ => Err(ScenarioError::Invalid(
                "each machine needs exactly one of 'path' or 'inline'".to_string(),
            )),
        }
    }
}

/// A loaded scenario bound to a running engine.
pub struct Simulation {
    engine: Engine<JsonContext>,
    instances: BTreeMap<String, (Handle, Arc<JsonContext>)>,
    events: Vec<EventEntry>,
    tick: u32,
}

impl Simulation {
    /// Registers every machine and creates every instance.
    pub fn load(scenario: &Scenario, config: &EngineConfig) -> Result<Self, ScenarioError> {
        let engine = Engine::with_config(config);
        Self::load_into(engine, scenario)
    }

    /// Like [`load`](Self::load), on an engine the caller already subscribed to.
    pub fn load_into(
        engine: Engine<JsonContext>,
        scenario: &Scenario,
    ) -> Result<Self, ScenarioError> {
        let default_group = engine.default_group().to_string();

        for entry in &scenario.machines {
            let mut doc = scenario.document(entry)?;
            if let Some(rate) = entry.process_rate {
                doc.process_rate = rate;
            }
            let group = entry.group.as_deref().unwrap_or(&default_group);
            for state in doc.undeclared_states() {
                tracing::warn!("machine '{}' references undeclared state '{}'", doc.name, state);
            }
            doc.register(engine.registry(), group)?;
        }

        let mut instances = BTreeMap::new();
        for entry in &scenario.instances {
            if instances.contains_key(&entry.name) {
                return Err(ScenarioError::Invalid(format!(
                    "duplicate instance name '{}'",
                    entry.name
                )));
            }
            let group = entry.group.as_deref().unwrap_or(&default_group);
            let ctx = Arc::new(JsonContext::new(entry.name.as_str(), entry.ctx.clone()));
            let handle = engine
                .registry()
                .create_instance(&entry.machine, ctx.clone(), group)?;
            instances.insert(entry.name.clone(), (handle, ctx));
        }

        for event in &scenario.events {
            if !instances.contains_key(&event.instance) {
                return Err(ScenarioError::Invalid(format!(
                    "event at tick {} targets unknown instance '{}'",
                    event.tick, event.instance
                )));
            }
        }

        Ok(Self {
            engine,
            instances,
            events: scenario.events.clone(),
            tick: 0,
        })
    }

    pub fn engine(&self) -> &Engine<JsonContext> {
        &self.engine
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u32 {
        self.tick
    }

    /// Instance names in sorted order.
    pub fn instance_names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn handle(&self, instance: &str) -> Option<&Handle> {
        self.instances.get(instance).map(|(handle, _)| handle)
    }

    pub fn context(&self, instance: &str) -> Option<&Arc<JsonContext>> {
        self.instances.get(instance).map(|(_, ctx)| ctx)
    }

    /// Groups ticked when none is named: every group with registered machines.
    pub fn groups(&self) -> Vec<String> {
        self.engine.registry().group_names()
    }

    /// Applies this tick's events, then ticks each group once.
    pub fn step(&mut self, group: Option<&str>) -> Vec<TickSummary> {
        self.tick += 1;
        for event in self.events.iter().filter(|e| e.tick == self.tick) {
            if let Some((_, ctx)) = self.instances.get(&event.instance) {
                ctx.merge(&event.set);
                if event.invalidate {
                    ctx.invalidate();
                }
            }
        }

        let groups = match group {
            Some(group) => vec![group.to_string()],
            None => self.groups(),
        };
        groups
            .iter()
            .map(|group| self.engine.update(group))
            .collect()
    }
}
