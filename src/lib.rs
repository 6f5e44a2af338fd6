// ============================================================================
// spark-recompose - A Reactive State & Effect Runtime for Rust
// ============================================================================
//
// Tracked state cells, minimal recomposition of scopes, keyed cancellable
// effects, and cold/hot streams with explicit backpressure.
//
//   core        runtime handle, configuration, ids, errors
//   primitives  cells, scopes, effects, tasks
//   reactivity  dependency tracking, batching, scheduling, equality
//   stream      flows, state flows, shared flows, operators
// ============================================================================

pub mod core;
pub mod primitives;
pub mod reactivity;
pub mod stream;

// Re-export core items at crate root
pub use core::constants;
pub use core::context::{FlushMode, Runtime, RuntimeBuilder, RuntimeConfig, WeakRuntime};
pub use core::error::{Cancelled, ObservedCell, RuntimeError, StreamError, TimedOut};
pub use core::types::{BoxError, CellId, EqualsFn, ScopeId, SlotKey, TaskId};

// Re-export primitives
pub use primitives::cell::{CellBuilder, StateCell};
pub use primitives::effect::{EffectInfo, EffectKeys, Key};
pub use primitives::latest::Latest;
pub use primitives::scope::{Composer, Composition};
pub use primitives::task::{CancelToken, Spawner, TaskCx, TaskHandle, TaskState, TokioSpawner};

// Re-export reactivity items
pub use reactivity::equality::{Identity, Policy};
pub use reactivity::scheduling::{PassPhase, PassReport};

// Re-export the stream engine's main types
pub use stream::{
    BackpressurePolicy, Flow, MutableStateFlow, SharedFlow, SharedFlowConfig, StateFlow,
};

// =============================================================================
// TESTS
// =============================================================================
