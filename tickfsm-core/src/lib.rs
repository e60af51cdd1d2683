//! # tickfsm-core
//!
//! Tick-driven finite state machine runtime.
//!
//! This crate provides:
//! - State, transition, and definition types with a fluent builder
//! - A registry of processing groups, definition buckets, and live instances
//! - The tick engine (rate throttling, enter/update/exit sequencing)
//! - Deferred structural changes and error-threshold degradation
//! - A diagnostic event channel

pub mod builder;
pub mod config;
pub mod context;
pub mod deferred;
pub mod definition;
pub mod degradation;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod instance;
pub mod registry;

#[cfg(test)]
mod testing;

pub use builder::{DefinitionBuilder, TransitionBuilder};
pub use config::{ConfigError, EngineConfig};
pub use context::Context;
pub use deferred::DeferredOp;
pub use definition::{Definition, ProcessRate, State, Transition, TransitionSource, ANY_STATE};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use engine::{Engine, StepOutcome, TickSummary};
pub use error::{BuildError, CallbackError, FsmError, Phase};
pub use instance::{Handle, InstanceId, InstanceSnapshot};
pub use registry::{Registration, Registry, RegistrySnapshot, WeakRegistry};
