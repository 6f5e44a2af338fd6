// ============================================================================
// spark-recompose - Scopes
// The re-runnable unit of computation, its Composer, and the Composition root
// ============================================================================
//
// A scope is a stored body closure plus whatever its last run produced: the
// ordered child scopes, the cells it read (with the versions it saw), its
// effect records, remembered values and emissions.
//
// A run moves the previous products out of the record and into a Composer.
// Each declaration in the body claims the previous product at its slot key
// (call-site + optional explicit key + occurrence). When the body returns,
// everything it claimed is stored back; everything it did not claim is
// disposed. Child scopes run inline, depth-first, while the parent runs.
// ============================================================================

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::hash::Hash;
use std::panic::Location;
use std::rc::Rc;

use crate::core::constants::*;
use crate::core::context::Runtime;
use crate::core::error::{ObservedCell, RuntimeError};
use crate::core::types::{hash_key, Arena, BoxError, CellId, ScopeId, SlotKey};
use crate::primitives::cell::{read_cell, release_cell, with_cell, write_cell, CellTable, StateCell};
use crate::primitives::effect::{EffectInfo, EffectRecord};
use crate::primitives::latest::Latest;
use crate::reactivity::equality::Policy;
use crate::reactivity::scheduling::{self, invalidate};

// =============================================================================
// TYPES
// =============================================================================

/// Body of a scope. Re-run by the scheduler whenever a cell it read changes.
pub(crate) type ScopeBody = Rc<dyn Fn(&mut Composer<'_>) -> Result<(), BoxError>>;

pub(crate) struct ScopeRecord {
    flags: u32,
    parent: Option<ScopeId>,
    root: ScopeId,
    depth: u32,
    seq: u64,
    slot: Option<SlotKey>,
    label: Option<Rc<str>>,
    body: ScopeBody,

    // Products of the last run
    children: Vec<(SlotKey, ScopeId)>,
    effects: Vec<(SlotKey, EffectRecord)>,
    remembered: Vec<(SlotKey, Rc<dyn Any>)>,
    cells: Vec<(SlotKey, CellId)>,
    emissions: Vec<Rc<dyn Any>>,
    observed: HashMap<CellId, u64>,
}

impl ScopeRecord {
    fn new(
        flags: u32,
        parent: Option<ScopeId>,
        root: Option<ScopeId>,
        depth: u32,
        seq: u64,
        slot: Option<SlotKey>,
        body: ScopeBody,
    ) -> Self {
        Self {
            flags,
            parent,
            // Patched for roots once the id is known
            root: root.unwrap_or(ScopeId {
                index: 0,
                generation: 0,
            }),
            depth,
            seq,
            slot,
            label: None,
            body,
            children: Vec::new(),
            effects: Vec::new(),
            remembered: Vec::new(),
            cells: Vec::new(),
            emissions: Vec::new(),
            observed: HashMap::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// (depth, creation order): the order a pass runs scopes in
    pub fn order(&self) -> (u32, u64) {
        (self.depth, self.seq)
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn is_paused(&self) -> bool {
        (self.flags & PAUSED) != 0
    }
}

/// Scope arena.
pub(crate) struct ScopeTable {
    arena: Arena<ScopeRecord>,
}

impl ScopeTable {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    fn insert(&mut self, record: ScopeRecord) -> ScopeId {
        let (index, generation) = self.arena.insert(record);
        ScopeId { index, generation }
    }

    pub fn get(&self, id: ScopeId) -> Option<&ScopeRecord> {
        self.arena.get(id.index, id.generation)
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeRecord> {
        self.arena.get_mut(id.index, id.generation)
    }

    fn remove(&mut self, id: ScopeId) -> Option<ScopeRecord> {
        self.arena.remove(id.index, id.generation)
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.arena.contains(id.index, id.generation)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the composition `id` belongs to is paused
    pub fn is_held(&self, id: ScopeId) -> bool {
        self.get(id)
            .and_then(|rec| self.get(rec.root))
            .is_some_and(ScopeRecord::is_paused)
    }

    /// Whether any cell the scope observed has moved past the version it saw.
    pub fn needs_run(&self, id: ScopeId, cells: &CellTable) -> bool {
        let Some(rec) = self.get(id) else {
            return false;
        };
        if (rec.flags & RUN_FAILED) != 0 || (rec.flags & SCOPE_RAN) == 0 {
            return true;
        }
        rec.observed
            .iter()
            .any(|(cell, seen)| cells.version(*cell) != Some(*seen))
    }
}

/// Error a parent body sees when one of its child scopes failed. The child's
/// failure itself is carried separately and becomes the pass error.
#[derive(Debug)]
struct ChildFailed(ScopeId);

impl fmt::Display for ChildFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child {} failed", self.0)
    }
}

impl Error for ChildFailed {}

// =============================================================================
// COMPOSER
// =============================================================================

/// Context handed to a scope body for one run.
///
/// Reads through the composer are recorded as dependencies of the running
/// scope; declarations (child scopes, effects, remembered values) are matched
/// to the previous run by call-site.
pub struct Composer<'rt> {
    rt: &'rt Runtime,
    scope: ScopeId,
    pass: u64,

    reads: HashMap<CellId, u64>,
    occurrences: HashMap<(Location<'static>, Option<u64>), u32>,

    old_children: HashMap<SlotKey, ScopeId>,
    old_order: Vec<SlotKey>,
    children: Vec<(SlotKey, ScopeId)>,

    old_effects: HashMap<SlotKey, EffectRecord>,
    effects: Vec<(SlotKey, EffectRecord)>,

    old_remembered: HashMap<SlotKey, Rc<dyn Any>>,
    remembered: Vec<(SlotKey, Rc<dyn Any>)>,

    old_cells: HashMap<SlotKey, CellId>,
    cells: Vec<(SlotKey, CellId)>,

    emissions: Vec<Rc<dyn Any>>,
    side_effects: Vec<Box<dyn FnOnce()>>,
    label: Option<Rc<str>>,

    failure: Option<RuntimeError>,
}

impl<'rt> Composer<'rt> {
    fn new(rt: &'rt Runtime, scope: ScopeId, pass: u64, previous: Products) -> Self {
        let old_order = previous.children.iter().map(|(slot, _)| *slot).collect();
        Self {
            rt,
            scope,
            pass,
            reads: HashMap::new(),
            occurrences: HashMap::new(),
            old_children: previous.children.into_iter().collect(),
            old_order,
            children: Vec::new(),
            old_effects: previous.effects.into_iter().collect(),
            effects: Vec::new(),
            old_remembered: previous.remembered.into_iter().collect(),
            remembered: Vec::new(),
            old_cells: previous.cells.into_iter().collect(),
            cells: Vec::new(),
            emissions: Vec::new(),
            side_effects: Vec::new(),
            label: None,
            failure: None,
        }
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    /// Id of the pass this run belongs to (0 for the initial composition)
    pub fn pass(&self) -> u64 {
        self.pass
    }

    /// Name this scope in paths and failure reports.
    pub fn set_label(&mut self, label: &str) {
        self.label = Some(Rc::from(label));
    }

    pub(crate) fn next_slot(&mut self, site: &'static Location<'static>, key: Option<u64>) -> SlotKey {
        let counter = self
            .occurrences
            .entry((*site, key))
            .or_insert(0);
        let occurrence = *counter;
        *counter += 1;
        SlotKey {
            site,
            key,
            occurrence,
        }
    }

    // =========================================================================
    // CELLS
    // =========================================================================

    /// Read a cell and record the dependency.
    ///
    /// # Panics
    ///
    /// Panics if the cell was released.
    pub fn read<T: Clone + 'static>(&mut self, cell: &StateCell<T>) -> T {
        match self.try_read(cell) {
            Ok(value) => value,
            Err(err) => panic!("cannot read cell in {}: {err}", self.scope),
        }
    }

    pub fn try_read<T: Clone + 'static>(&mut self, cell: &StateCell<T>) -> Result<T, RuntimeError> {
        let (value, version) = read_cell::<T>(self.rt, cell.id())?;
        self.track(cell.id(), version);
        Ok(value)
    }

    /// Borrow a cell's value and record the dependency.
    ///
    /// # Panics
    ///
    /// Panics if the cell was released, or if `f` writes a cell.
    pub fn with<T: 'static, R>(&mut self, cell: &StateCell<T>, f: impl FnOnce(&T) -> R) -> R {
        match with_cell(self.rt, cell.id(), f) {
            Ok((result, version)) => {
                self.track(cell.id(), version);
                result
            }
            Err(err) => panic!("cannot read cell in {}: {err}", self.scope),
        }
    }

    /// Read without recording a dependency.
    pub fn peek<T: Clone + 'static>(&self, cell: &StateCell<T>) -> T {
        self.rt.read(cell)
    }

    /// Run `f` with a detached view of the runtime; nothing it reads is
    /// recorded.
    pub fn untracked<R>(&self, f: impl FnOnce(&Runtime) -> R) -> R {
        f(self.rt)
    }

    fn track(&mut self, cell: CellId, version: u64) {
        // First observation wins: a later write by this run makes it stale
        self.reads.entry(cell).or_insert(version);
    }

    /// Write a cell. Invalidations caused during a run always land in the
    /// next pass, including this scope's own when it wrote a cell it read.
    pub fn write<T: 'static>(&mut self, cell: &StateCell<T>, value: T) -> bool {
        write_cell(self.rt, cell.id(), value)
    }

    pub fn update<T: Clone + 'static>(&mut self, cell: &StateCell<T>, f: impl FnOnce(&mut T)) -> bool {
        self.rt.update(cell, f)
    }

    // =========================================================================
    // CHILD SCOPES
    // =========================================================================

    /// Declare a child scope. It runs now, and re-runs on its own when a cell
    /// it read changes.
    ///
    /// Returns an error if the child (or one of its descendants) failed; the
    /// body should propagate it with `?`.
    #[track_caller]
    pub fn scope(
        &mut self,
        body: impl Fn(&mut Composer<'_>) -> Result<(), BoxError> + 'static,
    ) -> Result<(), BoxError> {
        let slot = self.next_slot(Location::caller(), None);
        self.child_at(slot, Rc::new(body))
    }

    /// Declare a child scope identified by `key` as well as the call-site,
    /// so it keeps its identity when siblings are reordered.
    ///
    /// ```ignore
    /// for item in &items {
    ///     let item = item.clone();
    ///     cx.keyed_scope(&item.id, move |cx| {
    ///         cx.emit(item.title.clone());
    ///         Ok(())
    ///     })?;
    /// }
    /// ```
    #[track_caller]
    pub fn keyed_scope<K: Hash + ?Sized>(
        &mut self,
        key: &K,
        body: impl Fn(&mut Composer<'_>) -> Result<(), BoxError> + 'static,
    ) -> Result<(), BoxError> {
        let slot = self.next_slot(Location::caller(), Some(hash_key(key)));
        self.child_at(slot, Rc::new(body))
    }

    fn child_at(&mut self, slot: SlotKey, body: ScopeBody) -> Result<(), BoxError> {
        if self.failure.is_some() {
            return Err(Box::new(ChildFailed(self.scope)));
        }

        let reused = self
            .old_children
            .remove(&slot)
            .filter(|id| self.rt.inner.scopes.borrow().contains(*id));

        let id = match reused {
            Some(id) => {
                if let Some(rec) = self.rt.inner.scopes.borrow_mut().get_mut(id) {
                    rec.body = body;
                }
                id
            }
            None => create_child(self.rt, self.scope, slot, body),
        };
        self.children.push((slot, id));

        match run_scope(self.rt, id, self.pass) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failure = Some(err);
                Err(Box::new(ChildFailed(id)))
            }
        }
    }

    // =========================================================================
    // REMEMBERED VALUES
    // =========================================================================

    /// Value created on the first run and handed back unchanged on later
    /// runs, until a run stops asking for it.
    #[track_caller]
    pub fn remember<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<T> {
        let slot = self.next_slot(Location::caller(), None);
        self.remember_at(slot, init)
    }

    fn remember_at<T: 'static>(&mut self, slot: SlotKey, init: impl FnOnce() -> T) -> Rc<T> {
        let value = match self.old_remembered.remove(&slot).map(|v| v.downcast::<T>()) {
            Some(Ok(value)) => value,
            _ => Rc::new(init()),
        };
        self.remembered.push((slot, value.clone() as Rc<dyn Any>));
        value
    }

    /// Holder refreshed with `value` on every run.
    #[track_caller]
    pub fn latest<T: 'static>(&mut self, value: T) -> Latest<T> {
        let slot = self.next_slot(Location::caller(), None);
        let holder = match self.old_remembered.remove(&slot).map(|v| v.downcast::<Latest<T>>()) {
            Some(Ok(holder)) => {
                holder.replace(value);
                holder
            }
            _ => Rc::new(Latest::new(value)),
        };
        self.remembered.push((slot, holder.clone() as Rc<dyn Any>));
        (*holder).clone()
    }

    /// Cell owned by this scope, created on the first run with structural
    /// equality. Released when the scope is disposed or a run stops asking
    /// for it.
    #[track_caller]
    pub fn remember_cell<T: PartialEq + 'static>(&mut self, init: impl FnOnce() -> T) -> StateCell<T> {
        let slot = self.next_slot(Location::caller(), None);
        self.remember_cell_at(slot, init, Policy::structural)
    }

    #[track_caller]
    pub fn remember_cell_with<T: 'static>(
        &mut self,
        init: impl FnOnce() -> T,
        policy: impl FnOnce() -> Policy<T>,
    ) -> StateCell<T> {
        let slot = self.next_slot(Location::caller(), None);
        self.remember_cell_at(slot, init, policy)
    }

    pub(crate) fn remember_cell_at<T: 'static>(
        &mut self,
        slot: SlotKey,
        init: impl FnOnce() -> T,
        policy: impl FnOnce() -> Policy<T>,
    ) -> StateCell<T> {
        if let Some(id) = self.old_cells.remove(&slot) {
            if self.rt.inner.cells.borrow().get::<T>(id).is_ok() {
                self.cells.push((slot, id));
                return StateCell::from_id(id);
            }
            release_cell(self.rt, id);
        }

        let id = self
            .rt
            .inner
            .cells
            .borrow_mut()
            .insert(init(), policy(), None, Some(self.scope));
        self.cells.push((slot, id));
        StateCell::from_id(id)
    }

    // =========================================================================
    // OUTPUT
    // =========================================================================

    /// Emit a value for the host. `Composition::emissions` returns what every
    /// scope emitted on its last completed run, in tree order.
    pub fn emit<T: 'static>(&mut self, value: T) {
        self.emissions.push(Rc::new(value));
    }

    /// Run `f` after the current pass completes successfully.
    pub fn side_effect(&mut self, f: impl FnOnce() + 'static) {
        self.side_effects.push(Box::new(f));
    }

    // =========================================================================
    // EFFECT RECORDS (used by the effect module)
    // =========================================================================

    pub(crate) fn take_effect(&mut self, slot: &SlotKey) -> Option<EffectRecord> {
        self.old_effects.remove(slot)
    }

    pub(crate) fn keep_effect(&mut self, slot: SlotKey, record: EffectRecord) {
        self.effects.push((slot, record));
    }
}

impl fmt::Debug for Composer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("scope", &self.scope)
            .field("pass", &self.pass)
            .field("reads", &self.reads.len())
            .field("children", &self.children.len())
            .finish()
    }
}

// =============================================================================
// RUNNING
// =============================================================================

/// Products of a run, moved out of the record while the next run executes.
struct Products {
    children: Vec<(SlotKey, ScopeId)>,
    effects: Vec<(SlotKey, EffectRecord)>,
    remembered: Vec<(SlotKey, Rc<dyn Any>)>,
    cells: Vec<(SlotKey, CellId)>,
}

fn create_child(rt: &Runtime, parent: ScopeId, slot: SlotKey, body: ScopeBody) -> ScopeId {
    let seq = rt.inner.allocate_scope_seq();
    let mut scopes = rt.inner.scopes.borrow_mut();
    let (root, depth) = scopes
        .get(parent)
        .map(|rec| (rec.root, rec.depth + 1))
        .unwrap_or((parent, 1));
    let id = scopes.insert(ScopeRecord::new(
        CHILD_SCOPE,
        Some(parent),
        Some(root),
        depth,
        seq,
        Some(slot),
        body,
    ));
    tracing::trace!(scope = %id, %parent, site = %slot, "scope created");
    id
}

fn create_root(rt: &Runtime, body: ScopeBody) -> ScopeId {
    let seq = rt.inner.allocate_scope_seq();
    let mut scopes = rt.inner.scopes.borrow_mut();
    let id = scopes.insert(ScopeRecord::new(ROOT_SCOPE, None, None, 0, seq, None, body));
    if let Some(rec) = scopes.get_mut(id) {
        rec.root = id;
    }
    id
}

/// Run one scope (and, inline, the child scopes it declares).
pub(crate) fn run_scope(rt: &Runtime, id: ScopeId, pass: u64) -> Result<(), RuntimeError> {
    let (body, previous) = {
        let mut scopes = rt.inner.scopes.borrow_mut();
        let Some(rec) = scopes.get_mut(id) else {
            return Err(RuntimeError::StaleScope(id));
        };
        rec.flags |= SCOPE_IS_RUNNING;
        let previous = Products {
            children: std::mem::take(&mut rec.children),
            effects: std::mem::take(&mut rec.effects),
            remembered: std::mem::take(&mut rec.remembered),
            cells: std::mem::take(&mut rec.cells),
        };
        (rec.body.clone(), previous)
    };
    scheduling::mark_ran(rt, id);

    let mut cx = Composer::new(rt, id, pass, previous);
    let result = body(&mut cx);

    let failure = match (result, cx.failure.take()) {
        (_, Some(child_failure)) => Some(child_failure),
        (Ok(()), None) => None,
        (Err(source), None) => Some(recomposition_failure(rt, id, pass, &cx.reads, source)),
    };

    match failure {
        None => {
            finish_run(rt, id, cx);
            Ok(())
        }
        Some(err) => {
            abort_run(rt, id, cx);
            Err(err)
        }
    }
}

/// Store what a successful run produced and dispose what it left behind.
fn finish_run(rt: &Runtime, id: ScopeId, cx: Composer<'_>) {
    let Composer {
        reads,
        old_children,
        children,
        old_effects,
        effects,
        old_remembered,
        remembered,
        old_cells,
        cells,
        emissions,
        side_effects,
        label,
        ..
    } = cx;

    rt.inner
        .tracker
        .borrow_mut()
        .replace_reads(id, reads.keys().copied().collect::<HashSet<_>>());

    let stale = {
        let cells_table = rt.inner.cells.borrow();
        reads
            .iter()
            .any(|(cell, seen)| cells_table.version(*cell) != Some(*seen))
    };

    let leftover = {
        let mut scopes = rt.inner.scopes.borrow_mut();
        match scopes.get_mut(id) {
            Some(rec) => {
                rec.children = children;
                rec.effects = effects;
                rec.remembered = remembered;
                rec.cells = cells;
                rec.emissions = emissions;
                rec.observed = reads;
                if label.is_some() {
                    rec.label = label;
                }
                rec.flags = ((rec.flags & STATUS_MASK) & !(SCOPE_IS_RUNNING | RUN_FAILED)) | CLEAN | SCOPE_RAN;
                None
            }
            // Disposed during its own run: nothing survives
            None => Some(Products {
                children,
                effects,
                remembered,
                cells,
            }),
        }
    };

    for (_, child) in old_children {
        dispose_scope(rt, child);
    }
    drop(old_effects);
    drop(old_remembered);
    for (_, cell) in old_cells {
        release_cell(rt, cell);
    }

    if let Some(products) = leftover {
        rt.inner.tracker.borrow_mut().remove_scope(id);
        discard(rt, products);
        return;
    }

    scheduling::queue_side_effects(rt, side_effects);

    // Wrote something it had already read: run again next pass
    if stale {
        tracing::trace!(scope = %id, "scope invalidated itself");
        invalidate(rt, &[id]);
    }
}

/// Keep everything after a failed run: completed child runs stay applied,
/// unreached children and effects are kept, reads are merged.
fn abort_run(rt: &Runtime, id: ScopeId, cx: Composer<'_>) {
    let Composer {
        reads,
        mut old_children,
        old_order,
        mut children,
        old_effects,
        mut effects,
        old_remembered,
        mut remembered,
        old_cells,
        mut cells,
        ..
    } = cx;

    for slot in old_order {
        if let Some(child) = old_children.remove(&slot) {
            children.push((slot, child));
        }
    }
    effects.extend(old_effects);
    remembered.extend(old_remembered);
    cells.extend(old_cells);

    rt.inner
        .tracker
        .borrow_mut()
        .merge_reads(id, reads.keys().copied().collect::<HashSet<_>>());

    let leftover = {
        let mut scopes = rt.inner.scopes.borrow_mut();
        match scopes.get_mut(id) {
            Some(rec) => {
                rec.children = children;
                rec.effects = effects;
                rec.remembered = remembered;
                rec.cells = cells;
                for (cell, version) in reads {
                    rec.observed.insert(cell, version);
                }
                rec.flags = (rec.flags & !SCOPE_IS_RUNNING) | RUN_FAILED;
                None
            }
            None => Some(Products {
                children,
                effects,
                remembered,
                cells,
            }),
        }
    };

    if let Some(products) = leftover {
        rt.inner.tracker.borrow_mut().remove_scope(id);
        discard(rt, products);
    }
}

fn discard(rt: &Runtime, products: Products) {
    for (_, child) in products.children {
        dispose_scope(rt, child);
    }
    drop(products.effects);
    drop(products.remembered);
    for (_, cell) in products.cells {
        release_cell(rt, cell);
    }
}

/// Dispose a scope and its subtree: cancel effects, release scope-local
/// cells, forget tracker edges and pending invalidations.
pub(crate) fn dispose_scope(rt: &Runtime, id: ScopeId) {
    let record = rt.inner.scopes.borrow_mut().remove(id);
    let Some(mut record) = record else {
        return;
    };

    rt.inner.tracker.borrow_mut().remove_scope(id);
    scheduling::forget(rt, id);

    for (_, child) in std::mem::take(&mut record.children) {
        dispose_scope(rt, child);
    }

    let effects = std::mem::take(&mut record.effects);
    drop(effects);

    for (_, cell) in std::mem::take(&mut record.cells) {
        release_cell(rt, cell);
    }

    tracing::trace!(scope = %id, "scope disposed");
    drop(record);
}

fn recomposition_failure(
    rt: &Runtime,
    id: ScopeId,
    pass: u64,
    reads: &HashMap<CellId, u64>,
    source: BoxError,
) -> RuntimeError {
    let mut observed: HashMap<CellId, u64> = rt
        .inner
        .scopes
        .borrow()
        .get(id)
        .map(|rec| rec.observed.clone())
        .unwrap_or_default();
    observed.extend(reads.iter().map(|(cell, version)| (*cell, *version)));

    let cells = rt.inner.cells.borrow();
    let mut observed: Vec<ObservedCell> = observed
        .into_iter()
        .map(|(cell, version)| ObservedCell {
            cell,
            version,
            label: cells.label(cell).map(|l| l.to_string()),
        })
        .collect();
    observed.sort_by_key(|o| o.cell);
    drop(cells);

    RuntimeError::RecompositionFailure {
        scope: id,
        path: scope_path(rt, id),
        pass,
        observed,
        source,
    }
}

/// Human-readable path from the root, e.g. `app/list/src/list.rs:42#3`.
pub(crate) fn scope_path(rt: &Runtime, id: ScopeId) -> String {
    let scopes = rt.inner.scopes.borrow();
    let mut segments = Vec::new();
    let mut current = Some(id);
    while let Some(scope) = current {
        let Some(rec) = scopes.get(scope) else {
            segments.push(scope.to_string());
            break;
        };
        let segment = match (&rec.label, &rec.slot) {
            (Some(label), _) => label.to_string(),
            (None, Some(slot)) => slot.to_string(),
            (None, None) => "root".to_string(),
        };
        segments.push(segment);
        current = rec.parent;
    }
    segments.reverse();
    segments.join("/")
}

// =============================================================================
// COMPOSITION
// =============================================================================

/// Handle to a composition root.
///
/// Dropping the handle disposes the whole tree: every effect is cancelled and
/// every scope-local cell released before `drop` returns.
pub struct Composition {
    rt: Runtime,
    root: ScopeId,
}

impl Runtime {
    /// Create a composition and run its root body once.
    ///
    /// If the first run fails the tree is torn down and the failure returned.
    ///
    /// # Example
    ///
    /// ```
    /// use spark_recompose::Runtime;
    ///
    /// let rt = Runtime::new();
    /// let name = rt.cell(String::from("world"));
    ///
    /// let composition = rt
    ///     .compose(move |cx| {
    ///         let name = cx.read(&name);
    ///         cx.emit(format!("hello {name}"));
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// assert_eq!(composition.emissions::<String>(), vec!["hello world"]);
    ///
    /// rt.write(&name, String::from("rust"));
    /// rt.flush().unwrap();
    /// assert_eq!(composition.emissions::<String>(), vec!["hello rust"]);
    /// ```
    pub fn compose(
        &self,
        body: impl Fn(&mut Composer<'_>) -> Result<(), BoxError> + 'static,
    ) -> Result<Composition, RuntimeError> {
        let root = create_root(self, Rc::new(body));
        tracing::debug!(scope = %root, "composition created");

        match scheduling::run_initial(self, root) {
            Ok(()) => Ok(Composition {
                rt: self.clone(),
                root,
            }),
            Err(err) => {
                dispose_scope(self, root);
                Err(err)
            }
        }
    }
}

impl Composition {
    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn is_alive(&self) -> bool {
        self.rt.inner.scopes.borrow().contains(self.root)
    }

    /// Every value of type `T` emitted on the last completed run of each
    /// scope, in tree order (a scope's own emissions, then its children's).
    pub fn emissions<T: Clone + 'static>(&self) -> Vec<T> {
        let scopes = self.rt.inner.scopes.borrow();
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(rec) = scopes.get(id) else {
                continue;
            };
            out.extend(
                rec.emissions
                    .iter()
                    .filter_map(|value| value.downcast_ref::<T>())
                    .cloned(),
            );
            stack.extend(rec.children.iter().rev().map(|(_, child)| *child));
        }
        out
    }

    /// Number of scopes in this composition
    pub fn scope_count(&self) -> usize {
        let scopes = self.rt.inner.scopes.borrow();
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(rec) = scopes.get(id) {
                count += 1;
                stack.extend(rec.children.iter().map(|(_, child)| *child));
            }
        }
        count
    }

    /// Effects declared by a scope on its last run.
    pub fn effects_of(&self, scope: ScopeId) -> Vec<EffectInfo> {
        self.rt
            .inner
            .scopes
            .borrow()
            .get(scope)
            .map(|rec| {
                rec.effects
                    .iter()
                    .map(|(slot, record)| EffectInfo::of(slot, record))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Child scope ids of `scope`, in declaration order.
    pub fn children_of(&self, scope: ScopeId) -> Vec<ScopeId> {
        self.rt
            .inner
            .scopes
            .borrow()
            .get(scope)
            .map(|rec| rec.children.iter().map(|(_, child)| *child).collect())
            .unwrap_or_default()
    }

    pub fn path_of(&self, scope: ScopeId) -> String {
        scope_path(&self.rt, scope)
    }

    /// Hold invalidations for this composition until `resume`.
    pub fn pause(&self) {
        if let Some(rec) = self.rt.inner.scopes.borrow_mut().get_mut(self.root) {
            rec.flags |= PAUSED;
        }
        tracing::debug!(scope = %self.root, "composition paused");
    }

    /// Release the invalidations held while paused.
    pub fn resume(&self) {
        let was_paused = {
            let mut scopes = self.rt.inner.scopes.borrow_mut();
            match scopes.get_mut(self.root) {
                Some(rec) => {
                    let paused = rec.is_paused();
                    rec.flags &= !PAUSED;
                    paused
                }
                None => false,
            }
        };
        if was_paused {
            tracing::debug!(scope = %self.root, "composition resumed");
            scheduling::release_held(&self.rt, self.root);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.rt
            .inner
            .scopes
            .borrow()
            .get(self.root)
            .is_some_and(ScopeRecord::is_paused)
    }

    /// Tear the tree down now.
    pub fn dispose(self) {
        // Drop does the work
    }
}

impl Drop for Composition {
    fn drop(&mut self) {
        if self.is_alive() {
            tracing::debug!(scope = %self.root, "composition disposed");
            dispose_scope(&self.rt, self.root);
        }
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("root", &self.root)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let c = Rc::new(Cell::new(0));
        (c.clone(), c)
    }

    #[test]
    fn root_runs_once_on_compose() {
        let rt = Runtime::new();
        let (runs, runs_in) = counter();
        let _comp = rt
            .compose(move |_| {
                runs_in.set(runs_in.get() + 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(runs.get(), 1);
        assert_eq!(rt.scope_count(), 1);
    }

    #[test]
    fn reads_are_tracked() {
        let rt = Runtime::new();
        let a = rt.cell(1);
        let b = rt.cell(2);

        let comp = rt
            .compose(move |cx| {
                let _ = cx.read(&a);
                let _ = cx.peek(&b);
                Ok(())
            })
            .unwrap();

        let tracker = rt.inner.tracker.borrow();
        assert!(tracker.is_observing(comp.root(), a.id()));
        assert!(!tracker.is_observing(comp.root(), b.id()));
    }

    #[test]
    fn children_reused_by_slot() {
        let rt = Runtime::new();
        let flag = rt.cell(0);

        let comp = rt
            .compose(move |cx| {
                let _ = cx.read(&flag);
                cx.scope(|_| Ok(()))?;
                Ok(())
            })
            .unwrap();

        let before = comp.children_of(comp.root());
        rt.write(&flag, 1);
        rt.flush().unwrap();
        let after = comp.children_of(comp.root());

        assert_eq!(before.len(), 1);
        assert_eq!(before, after);
    }

    #[test]
    fn dropped_children_are_disposed() {
        let rt = Runtime::new();
        let show = rt.cell(true);

        let comp = rt
            .compose(move |cx| {
                if cx.read(&show) {
                    cx.scope(|cx| {
                        cx.remember_cell(|| 0);
                        Ok(())
                    })?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(comp.scope_count(), 2);
        assert_eq!(rt.cell_count(), 2);

        rt.write(&show, false);
        rt.flush().unwrap();

        assert_eq!(comp.scope_count(), 1);
        assert_eq!(rt.scope_count(), 1);
        // The child's remembered cell went with it
        assert_eq!(rt.cell_count(), 1);
    }

    #[test]
    fn keyed_children_follow_their_key() {
        let rt = Runtime::new();
        let items = rt.cell(vec!["a", "b"]);
        let created = Rc::new(RefCell::new(Vec::new()));
        let created_in = created.clone();

        let comp = rt
            .compose(move |cx| {
                for item in cx.read(&items) {
                    let created = created_in.clone();
                    cx.keyed_scope(item, move |cx| {
                        let first = cx.remember(|| {
                            created.borrow_mut().push(item);
                            item
                        });
                        cx.emit(*first);
                        Ok(())
                    })?;
                }
                Ok(())
            })
            .unwrap();

        rt.write(&items, vec!["b", "a"]);
        rt.flush().unwrap();

        assert_eq!(comp.emissions::<&str>(), vec!["b", "a"]);
        assert_eq!(*created.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn occurrences_count_by_site_value() {
        let rt = Runtime::new();
        let slots = Rc::new(RefCell::new(Vec::new()));
        let slots_in = slots.clone();

        let _comp = rt
            .compose(move |cx| {
                let site = Location::caller();
                // Same file, line and column behind a different reference
                let copy: &'static Location<'static> = Box::leak(Box::new(*site));
                let first = cx.next_slot(site, None);
                let second = cx.next_slot(copy, None);
                slots_in.borrow_mut().extend([first, second]);
                Ok(())
            })
            .unwrap();

        let slots = slots.borrow();
        assert_ne!(slots[0], slots[1]);
        assert_eq!(slots[0].occurrence, 0);
        assert_eq!(slots[1].occurrence, 1);
    }

    #[test]
    fn remember_survives_runs() {
        let rt = Runtime::new();
        let tick = rt.cell(0);
        let inits = Rc::new(Cell::new(0));
        let inits_in = inits.clone();

        let comp = rt
            .compose(move |cx| {
                let _ = cx.read(&tick);
                let value = cx.remember(|| {
                    inits_in.set(inits_in.get() + 1);
                    42
                });
                cx.emit(*value);
                Ok(())
            })
            .unwrap();

        for i in 1..=3 {
            rt.write(&tick, i);
            rt.flush().unwrap();
        }

        assert_eq!(inits.get(), 1);
        assert_eq!(comp.emissions::<i32>(), vec![42]);
    }

    #[test]
    fn latest_is_refreshed() {
        let rt = Runtime::new();
        let source = rt.cell(1);
        let holder = Rc::new(RefCell::new(None));
        let holder_in = holder.clone();

        let _comp = rt
            .compose(move |cx| {
                let value = cx.read(&source);
                let latest = cx.latest(value);
                holder_in.borrow_mut().get_or_insert(latest);
                Ok(())
            })
            .unwrap();

        rt.write(&source, 5);
        rt.flush().unwrap();
        assert_eq!(holder.borrow().as_ref().map(Latest::get), Some(5));
    }

    #[test]
    fn emissions_in_tree_order() {
        let rt = Runtime::new();
        let comp = rt
            .compose(|cx| {
                cx.emit("root");
                cx.scope(|cx| {
                    cx.emit("a");
                    cx.scope(|cx| {
                        cx.emit("a1");
                        Ok(())
                    })
                })?;
                cx.scope(|cx| {
                    cx.emit("b");
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();

        assert_eq!(comp.emissions::<&str>(), vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn labels_build_paths() {
        let rt = Runtime::new();
        let child = Rc::new(Cell::new(None));
        let child_in = child.clone();

        let comp = rt
            .compose(move |cx| {
                cx.set_label("app");
                let child_in = child_in.clone();
                cx.scope(move |cx| {
                    cx.set_label("list");
                    child_in.set(Some(cx.scope_id()));
                    Ok(())
                })
            })
            .unwrap();

        let child = child.get().unwrap();
        assert_eq!(comp.path_of(child), "app/list");
    }

    #[test]
    fn failed_initial_compose_tears_down() {
        let rt = Runtime::new();
        let result = rt.compose(|cx| {
            cx.remember_cell(|| 1);
            Err("nope".into())
        });

        assert!(matches!(result, Err(RuntimeError::RecompositionFailure { .. })));
        assert_eq!(rt.scope_count(), 0);
        assert_eq!(rt.cell_count(), 0);
    }

    #[test]
    fn drop_disposes_tree() {
        let rt = Runtime::new();
        let comp = rt
            .compose(|cx| {
                cx.scope(|_| Ok(()))?;
                cx.scope(|_| Ok(()))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(rt.scope_count(), 3);
        drop(comp);
        assert_eq!(rt.scope_count(), 0);
    }

    #[test]
    fn disposable_effect_cleanup() {
        let rt = Runtime::new();
        let key = rt.cell(1);
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_in = log.clone();

        let comp = rt
            .compose(move |cx| {
                let k = cx.read(&key);
                let log = log_in.clone();
                cx.disposable_effect(k, move || {
                    log.borrow_mut().push(format!("setup {k}"));
                    let log = log.clone();
                    move || log.borrow_mut().push(format!("cleanup {k}"))
                });
                Ok(())
            })
            .unwrap();

        rt.write(&key, 2);
        rt.flush().unwrap();
        drop(comp);

        assert_eq!(
            *log.borrow(),
            vec!["setup 1", "cleanup 1", "setup 2", "cleanup 2"]
        );
    }
}
