// ============================================================================
// spark-recompose - Core Module
// Identifiers, errors, constants and the runtime context
// ============================================================================

pub mod constants;
pub mod context;
pub mod error;
pub mod types;

pub use context::{FlushMode, Runtime, RuntimeBuilder, RuntimeConfig, WeakRuntime};
pub use error::{Cancelled, ObservedCell, RuntimeError, StreamError, TimedOut};
pub use types::{BoxError, CellId, EqualsFn, ScopeId, SlotKey, TaskId};
