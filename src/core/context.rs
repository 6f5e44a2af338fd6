// ============================================================================
// spark-recompose - Runtime Context
// The single owner of cells, the dependency graph, scopes and the scheduler
// ============================================================================
//
// Everything that mutates the cell table or the dependency graph goes through
// one `Runtime`. It is `Rc`-based and therefore `!Send`: the runtime lives on
// one composition thread, and effect tasks are local futures that reach back
// into it through a `WeakRuntime`.
//
// Nothing here is ambient. Scope code receives a `Composer` that carries the
// runtime and the active scope explicitly.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::constants::DEFAULT_MAX_PASSES;
use crate::core::error::RuntimeError;
use crate::core::types::TaskId;
use crate::primitives::cell::CellTable;
use crate::primitives::scope::ScopeTable;
use crate::primitives::task::{Spawner, TokioSpawner};
use crate::reactivity::scheduling::SchedulerState;
use crate::reactivity::tracking::Tracker;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// When a recomposition pass runs after a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Writes only mark scopes pending; the host runs passes with
    /// `Runtime::flush` or by awaiting `Runtime::drive`.
    #[default]
    Deferred,
    /// A pass runs synchronously right after each write, unless the write
    /// happens inside `Runtime::batch` or during a pass.
    Immediate,
}

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// When passes run
    pub flush_mode: FlushMode,
    /// Consecutive passes a single flush may run before failing with
    /// `ReentrantWriteOverflow`
    pub max_passes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Deferred,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }
}

/// Builder for a `Runtime`.
///
/// # Example
///
/// ```
/// use spark_recompose::{FlushMode, Runtime};
///
/// let rt = Runtime::builder()
///     .flush_mode(FlushMode::Immediate)
///     .max_passes(16)
///     .build();
///
/// assert_eq!(rt.config().max_passes, 16);
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    spawner: Option<Rc<dyn Spawner>>,
}

impl RuntimeBuilder {
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn max_passes(mut self, passes: usize) -> Self {
        self.config.max_passes = passes.max(1);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Executor used to run effect tasks. Defaults to `TokioSpawner`.
    pub fn spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Some(Rc::new(spawner));
        self
    }

    pub fn build(self) -> Runtime {
        let spawner = self
            .spawner
            .unwrap_or_else(|| Rc::new(TokioSpawner) as Rc<dyn Spawner>);
        Runtime {
            inner: Rc::new(RuntimeInner::new(self.config, spawner)),
        }
    }
}

// =============================================================================
// RUNTIME INNER
// =============================================================================

/// Shared state behind a `Runtime` handle.
pub struct RuntimeInner {
    pub(crate) config: RuntimeConfig,

    // =========================================================================
    // STORE + GRAPH
    // =========================================================================
    /// Cell table (values, versions, policies)
    pub(crate) cells: RefCell<CellTable>,

    /// scope <-> cell dependency edges
    pub(crate) tracker: RefCell<Tracker>,

    /// Scope arena
    pub(crate) scopes: RefCell<ScopeTable>,

    // =========================================================================
    // SCHEDULING
    // =========================================================================
    /// Pass state machine and pending invalidations
    pub(crate) scheduler: RefCell<SchedulerState>,

    /// Current batch depth (for nested batches)
    pub(crate) batch_depth: Cell<u32>,

    // =========================================================================
    // COUNTERS
    // =========================================================================
    /// Global write version - incremented on every distinct cell write
    pub(crate) write_version: Cell<u64>,

    /// Creation order of scopes (tie-breaker when sorting by depth)
    pub(crate) next_scope_seq: Cell<u64>,

    // =========================================================================
    // EFFECTS
    // =========================================================================
    /// Executor for effect tasks
    pub(crate) spawner: Rc<dyn Spawner>,

    /// Errors that were recovered locally (effect failures, failures seen by
    /// the async driver). Kept until the host drains them.
    pub(crate) diagnostics: RefCell<Vec<RuntimeError>>,
}

impl RuntimeInner {
    fn new(config: RuntimeConfig, spawner: Rc<dyn Spawner>) -> Self {
        Self {
            config,
            cells: RefCell::new(CellTable::new()),
            tracker: RefCell::new(Tracker::new()),
            scopes: RefCell::new(ScopeTable::new()),
            scheduler: RefCell::new(SchedulerState::new()),
            batch_depth: Cell::new(0),
            write_version: Cell::new(0),
            next_scope_seq: Cell::new(0),
            spawner,
            diagnostics: RefCell::new(Vec::new()),
        }
    }

    /// Increment and return the global write version
    pub(crate) fn increment_write_version(&self) -> u64 {
        let v = self.write_version.get() + 1;
        self.write_version.set(v);
        v
    }

    pub(crate) fn allocate_task_id(&self) -> TaskId {
        TaskId::next()
    }

    pub(crate) fn allocate_scope_seq(&self) -> u64 {
        let seq = self.next_scope_seq.get();
        self.next_scope_seq.set(seq + 1);
        seq
    }

    /// Increment batch depth, returns new depth
    pub(crate) fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    /// Decrement batch depth, returns new depth
    pub(crate) fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    pub(crate) fn record(&self, error: RuntimeError) {
        self.diagnostics.borrow_mut().push(error);
    }
}

// =============================================================================
// RUNTIME HANDLE
// =============================================================================

/// Handle to a reactive runtime. Cheap to clone; all clones share state.
///
/// # Example
///
/// ```
/// use spark_recompose::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.cell(0);
///
/// assert_eq!(rt.read(&count), 0);
/// assert!(rt.write(&count, 1));
/// assert!(!rt.write(&count, 1)); // equal value, elided
/// ```
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Runtime with the default configuration and the tokio spawner.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Global write version (number of distinct writes so far)
    pub fn write_version(&self) -> u64 {
        self.inner.write_version.get()
    }

    /// Take the locally-recovered errors recorded so far.
    pub fn drain_diagnostics(&self) -> Vec<RuntimeError> {
        std::mem::take(&mut *self.inner.diagnostics.borrow_mut())
    }

    /// Number of live scopes across all compositions
    pub fn scope_count(&self) -> usize {
        self.inner.scopes.borrow().len()
    }

    /// Number of live cells
    pub fn cell_count(&self) -> usize {
        self.inner.cells.borrow().len()
    }

    /// Whether two handles refer to the same runtime
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn spawner(&self) -> Rc<dyn Spawner> {
        self.inner.spawner.clone()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("scopes", &self.scope_count())
            .field("cells", &self.cell_count())
            .field("write_version", &self.write_version())
            .finish()
    }
}

/// Weak handle to a runtime, held by effect tasks so they never keep the
/// runtime alive on their own.
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl fmt::Debug for WeakRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRuntime")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_creation() {
        let rt = Runtime::new();
        assert_eq!(rt.write_version(), 0);
        assert_eq!(rt.scope_count(), 0);
        assert_eq!(rt.cell_count(), 0);
        assert_eq!(rt.config().flush_mode, FlushMode::Deferred);
        assert_eq!(rt.config().max_passes, DEFAULT_MAX_PASSES);
    }

    #[test]
    fn builder_clamps_max_passes() {
        let rt = Runtime::builder().max_passes(0).build();
        assert_eq!(rt.config().max_passes, 1);
    }

    #[test]
    fn batch_depth_counter() {
        let rt = Runtime::new();
        assert_eq!(rt.inner.enter_batch(), 1);
        assert_eq!(rt.inner.enter_batch(), 2);
        assert_eq!(rt.inner.exit_batch(), 1);
        assert_eq!(rt.inner.exit_batch(), 0);
        assert_eq!(rt.inner.exit_batch(), 0);
    }

    #[test]
    fn ids_are_monotonic() {
        let rt = Runtime::new();
        let a = rt.inner.allocate_task_id();
        let b = rt.inner.allocate_task_id();
        assert!(b > a);
        assert_eq!(rt.inner.allocate_scope_seq(), 0);
        assert_eq!(rt.inner.allocate_scope_seq(), 1);
    }

    #[test]
    fn weak_runtime_does_not_keep_alive() {
        let rt = Runtime::new();
        let weak = rt.downgrade();
        assert!(weak.upgrade().is_some());
        drop(rt);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn diagnostics_drain() {
        let rt = Runtime::new();
        rt.inner.record(RuntimeError::RuntimeGone);
        assert_eq!(rt.drain_diagnostics().len(), 1);
        assert!(rt.drain_diagnostics().is_empty());
    }
}
