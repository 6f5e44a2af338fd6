// ============================================================================
// spark-recompose - Reactivity Module
// Dependency tracking, equality policies, batching and the pass scheduler
// ============================================================================

pub mod batching;
pub mod equality;
pub mod scheduling;
pub mod tracking;

pub use equality::{Identity, Policy};
pub use scheduling::{PassPhase, PassReport};
