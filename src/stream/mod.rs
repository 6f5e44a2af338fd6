// ============================================================================
// spark-recompose - Stream Engine
// Cold flows, hot state and broadcast flows, operators and backpressure
// ============================================================================

pub mod bridge;
pub mod buffer;
pub mod combine;
pub mod flatten;
pub mod flow;
pub mod operators;
pub mod shared_flow;
pub mod state_flow;

pub use buffer::BackpressurePolicy;
pub use flatten::merge;
pub use flow::{empty, failing, flow, flow_of, Emitter, Flow, FlowStream};
pub use shared_flow::{SharedFlow, SharedFlowConfig, SharedSubscription};
pub use state_flow::{MutableStateFlow, StateFlow, StateSubscription};
