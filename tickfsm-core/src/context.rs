//! The capability contract the engine requires from bound data objects.

/// Caller-owned data object an instance is bound to.
///
/// The engine only ever asks two things of a context: whether it is still
/// valid and what it is called. Everything else is reached by the state
/// callbacks and transition conditions, which receive the concrete type.
///
/// A context that reports `is_valid() == false` is treated as an
/// unrecoverable condition for every instance bound to it: the instance is
/// not stepped and is scheduled for removal.
pub trait Context: Send + Sync + 'static {
    /// Returns false once the underlying object is gone.
    fn is_valid(&self) -> bool;

    /// Display name used in diagnostics.
    fn name(&self) -> &str;
}
