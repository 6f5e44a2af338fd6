// ============================================================================
// spark-recompose - Primitives Module
// State cells, scopes, effects and tasks
// ============================================================================

pub mod cell;
pub mod effect;
pub mod latest;
pub mod scope;
pub mod task;

pub use cell::{CellBuilder, StateCell};
pub use effect::{EffectInfo, EffectKeys, Key};
pub use latest::Latest;
pub use scope::{Composer, Composition};
pub use task::{CancelToken, Spawner, TaskCx, TaskHandle, TaskState, TokioSpawner};
