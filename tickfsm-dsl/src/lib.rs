//! # tickfsm-dsl
//!
//! Declarative machines for tickfsm.
//!
//! This crate provides:
//! - Guard expressions evaluated against a JSON context
//! - YAML/JSON machine documents compiled into engine definitions
//! - [`JsonContext`], the context type those definitions run against

pub mod context;
pub mod error;
pub mod guard;
pub mod machine;

pub use context::JsonContext;
pub use error::DslError;
pub use guard::{CmpOp, Expr, Guard};
pub use machine::{Action, MachineDocument, StateSpec, TransitionSpec};
