// ============================================================================
// spark-recompose - State Cell Store
// Versioned mutable values with an explicit equality policy
// ============================================================================
//
// The store exclusively owns every cell value. Handles (`StateCell<T>`) are
// plain typed ids: there is no way to mutate a value except through the
// store's write path, which applies the cell's equality policy, bumps the
// version and hands the observing scopes to the scheduler.
// ============================================================================

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::core::context::Runtime;
use crate::core::error::RuntimeError;
use crate::core::types::{Arena, CellId, ScopeId};
use crate::reactivity::equality::Policy;
use crate::reactivity::scheduling::invalidate;

// =============================================================================
// CELL TABLE
// =============================================================================

/// Typed payload of a cell
struct Stored<T> {
    value: T,
    policy: Policy<T>,
}

/// Type-erased cell record
pub(crate) struct CellSlot {
    value: Box<dyn Any>,
    version: u64,
    label: Option<Rc<str>>,
    owner: Option<ScopeId>,
}

pub(crate) struct CellTable {
    arena: Arena<CellSlot>,
}

impl CellTable {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    pub fn insert<T: 'static>(
        &mut self,
        value: T,
        policy: Policy<T>,
        label: Option<Rc<str>>,
        owner: Option<ScopeId>,
    ) -> CellId {
        let (index, generation) = self.arena.insert(CellSlot {
            value: Box::new(Stored { value, policy }),
            version: 0,
            label,
            owner,
        });
        CellId { index, generation }
    }

    fn slot(&self, id: CellId) -> Result<&CellSlot, RuntimeError> {
        self.arena
            .get(id.index, id.generation)
            .ok_or(RuntimeError::StaleCell(id))
    }

    /// Borrow a typed value and its version.
    pub fn get<T: 'static>(&self, id: CellId) -> Result<(&T, u64), RuntimeError> {
        let slot = self.slot(id)?;
        let stored = slot
            .value
            .downcast_ref::<Stored<T>>()
            .ok_or(RuntimeError::StaleCell(id))?;
        Ok((&stored.value, slot.version))
    }

    pub fn version(&self, id: CellId) -> Option<u64> {
        self.slot(id).ok().map(|slot| slot.version)
    }

    pub fn label(&self, id: CellId) -> Option<Rc<str>> {
        self.slot(id).ok().and_then(|slot| slot.label.clone())
    }

    pub fn owner(&self, id: CellId) -> Option<ScopeId> {
        self.slot(id).ok().and_then(|slot| slot.owner)
    }

    /// Remove a cell, returning its erased value so the caller can drop it
    /// outside of any borrow.
    pub fn remove(&mut self, id: CellId) -> Option<Box<dyn Any>> {
        self.arena
            .remove(id.index, id.generation)
            .map(|slot| slot.value)
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.arena.contains(id.index, id.generation)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }
}

// =============================================================================
// STATE CELL HANDLE
// =============================================================================

/// Typed handle to a cell owned by a `Runtime`.
///
/// Handles are `Copy`; they carry no value and no reference to the runtime.
/// Reading through a `Composer` records a dependency, reading through the
/// `Runtime` does not.
pub struct StateCell<T> {
    id: CellId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateCell<T> {
    pub(crate) fn from_id(id: CellId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateCell<T> {}

impl<T> PartialEq for StateCell<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for StateCell<T> {}

impl<T> Hash for StateCell<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateCell").field(&self.id).finish()
    }
}

// =============================================================================
// STORE OPERATIONS (Internal)
// =============================================================================

/// Read a cell value and its version without tracking.
pub(crate) fn read_cell<T: Clone + 'static>(
    rt: &Runtime,
    id: CellId,
) -> Result<(T, u64), RuntimeError> {
    let cells = rt.inner.cells.borrow();
    let (value, version) = cells.get::<T>(id)?;
    Ok((value.clone(), version))
}

/// Borrow a cell value without tracking.
///
/// `f` runs while the cell table is borrowed: it may read other cells but
/// must not write.
pub(crate) fn with_cell<T: 'static, R>(
    rt: &Runtime,
    id: CellId,
    f: impl FnOnce(&T) -> R,
) -> Result<(R, u64), RuntimeError> {
    let cells = rt.inner.cells.borrow();
    let (value, version) = cells.get::<T>(id)?;
    Ok((f(value), version))
}

/// The store's write path.
///
/// Compares under the cell's policy; on a distinct value stores it, bumps the
/// version and enqueues every observing scope as pending. Returns whether the
/// write was applied.
pub(crate) fn write_cell<T: 'static>(rt: &Runtime, id: CellId, value: T) -> bool {
    let (old, version) = {
        let mut cells = rt.inner.cells.borrow_mut();
        let Some(slot) = cells.arena.get_mut(id.index, id.generation) else {
            tracing::warn!(cell = %id, "write to a released cell ignored");
            return false;
        };
        let Some(stored) = slot.value.downcast_mut::<Stored<T>>() else {
            tracing::warn!(cell = %id, "write with mismatched type ignored");
            return false;
        };

        if stored.policy.equals(&stored.value, &value) {
            tracing::trace!(cell = %id, policy = stored.policy.name(), "equal write elided");
            return false;
        }

        let old = std::mem::replace(&mut stored.value, value);
        slot.version += 1;
        (old, slot.version)
    };
    // Drop the previous value outside the borrow
    drop(old);

    rt.inner.increment_write_version();
    let observers = rt.inner.tracker.borrow().observers_of(id);
    tracing::trace!(cell = %id, version, observers = observers.len(), "cell written");

    invalidate(rt, &observers);
    true
}

/// Release a cell: drop its value and forget its dependency edges.
pub(crate) fn release_cell(rt: &Runtime, id: CellId) -> bool {
    let value = rt.inner.cells.borrow_mut().remove(id);
    match value {
        Some(value) => {
            rt.inner.tracker.borrow_mut().remove_cell(id);
            drop(value);
            true
        }
        None => false,
    }
}

// =============================================================================
// CELL BUILDER
// =============================================================================

type Validator<T> = Box<dyn FnOnce(&T) -> Result<(), String>>;

/// Builder for cells that need a label or a validated initial value.
///
/// # Example
///
/// ```
/// use spark_recompose::{Policy, Runtime, RuntimeError};
///
/// let rt = Runtime::new();
/// let rejected = rt
///     .cell_builder(-1i32, Policy::structural())
///     .label("age")
///     .validate(|v| if *v >= 0 { Ok(()) } else { Err("negative".into()) })
///     .build();
///
/// assert!(matches!(rejected, Err(RuntimeError::InvalidInitial { .. })));
/// ```
pub struct CellBuilder<'rt, T> {
    rt: &'rt Runtime,
    initial: T,
    policy: Policy<T>,
    label: Option<String>,
    validator: Option<Validator<T>>,
}

impl<'rt, T: 'static> CellBuilder<'rt, T> {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Reject the initial value with `InvalidInitial` if `f` returns an error.
    pub fn validate(mut self, f: impl FnOnce(&T) -> Result<(), String> + 'static) -> Self {
        self.validator = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<StateCell<T>, RuntimeError> {
        if let Some(validate) = self.validator {
            if let Err(reason) = validate(&self.initial) {
                return Err(RuntimeError::InvalidInitial {
                    label: self.label.unwrap_or_else(|| "<unnamed>".to_string()),
                    reason,
                });
            }
        }

        let id = self.rt.inner.cells.borrow_mut().insert(
            self.initial,
            self.policy,
            self.label.map(Rc::from),
            None,
        );
        tracing::trace!(cell = %id, "cell created");
        Ok(StateCell::from_id(id))
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

impl Runtime {
    /// Create a cell with the given equality policy.
    pub fn create_cell<T: 'static>(&self, initial: T, policy: Policy<T>) -> StateCell<T> {
        let id = self
            .inner
            .cells
            .borrow_mut()
            .insert(initial, policy, None, None);
        StateCell::from_id(id)
    }

    /// Create a cell with structural (`PartialEq`) equality.
    pub fn cell<T: PartialEq + 'static>(&self, initial: T) -> StateCell<T> {
        self.create_cell(initial, Policy::structural())
    }

    /// Start building a cell with a label and/or initial-value validation.
    pub fn cell_builder<T: 'static>(&self, initial: T, policy: Policy<T>) -> CellBuilder<'_, T> {
        CellBuilder {
            rt: self,
            initial,
            policy,
            label: None,
            validator: None,
        }
    }

    /// Detached read: returns the value without recording any dependency.
    ///
    /// # Panics
    ///
    /// Panics if the cell was released. Use `try_read` to handle that case.
    pub fn read<T: Clone + 'static>(&self, cell: &StateCell<T>) -> T {
        match read_cell::<T>(self, cell.id) {
            Ok((value, _)) => value,
            Err(err) => panic!("cannot read cell: {err}"),
        }
    }

    /// Detached read that reports released cells.
    pub fn try_read<T: Clone + 'static>(&self, cell: &StateCell<T>) -> Result<T, RuntimeError> {
        read_cell::<T>(self, cell.id).map(|(value, _)| value)
    }

    /// Borrow the value without cloning (detached).
    ///
    /// # Panics
    ///
    /// Panics if the cell was released, or if `f` writes a cell.
    pub fn with<T: 'static, R>(&self, cell: &StateCell<T>, f: impl FnOnce(&T) -> R) -> R {
        match with_cell(self, cell.id, f) {
            Ok((result, _)) => result,
            Err(err) => panic!("cannot read cell: {err}"),
        }
    }

    /// Write a value. Returns false if the write was elided (equal value) or
    /// the cell was released.
    pub fn write<T: 'static>(&self, cell: &StateCell<T>, value: T) -> bool {
        write_cell(self, cell.id, value)
    }

    /// Modify the value through a closure; goes through the same policy check
    /// as `write`.
    pub fn update<T: Clone + 'static>(&self, cell: &StateCell<T>, f: impl FnOnce(&mut T)) -> bool {
        let Ok((mut next, _)) = read_cell::<T>(self, cell.id) else {
            return false;
        };
        f(&mut next);
        write_cell(self, cell.id, next)
    }

    /// Version of the cell (0 until the first distinct write)
    pub fn version<T>(&self, cell: &StateCell<T>) -> Option<u64> {
        self.inner.cells.borrow().version(cell.id)
    }

    /// Label given at creation, if any
    pub fn label<T>(&self, cell: &StateCell<T>) -> Option<String> {
        self.inner
            .cells
            .borrow()
            .label(cell.id)
            .map(|l| l.to_string())
    }

    pub fn is_alive<T>(&self, cell: &StateCell<T>) -> bool {
        self.inner.cells.borrow().contains(cell.id)
    }

    /// Number of scopes that read the cell on their most recent run
    pub fn observer_count<T>(&self, cell: &StateCell<T>) -> usize {
        self.inner.tracker.borrow().observer_count(cell.id)
    }

    /// Release a cell created with `create_cell`/`cell`. Scope-local cells
    /// are released by their scope and cannot be released here.
    pub fn release<T>(&self, cell: StateCell<T>) -> bool {
        if self.inner.cells.borrow().owner(cell.id).is_some() {
            return false;
        }
        release_cell(self, cell.id)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn create_and_read() {
        let rt = Runtime::new();
        let cell = rt.cell(42);
        assert_eq!(rt.read(&cell), 42);
        assert_eq!(rt.version(&cell), Some(0));
    }

    #[test]
    fn distinct_write_bumps_version() {
        let rt = Runtime::new();
        let cell = rt.cell(1);

        assert!(rt.write(&cell, 2));
        assert_eq!(rt.version(&cell), Some(1));
        assert!(rt.write(&cell, 3));
        assert_eq!(rt.version(&cell), Some(2));
        assert_eq!(rt.write_version(), 2);
    }

    #[test]
    fn equal_write_is_elided() {
        let rt = Runtime::new();
        let cell = rt.cell(String::from("a"));

        assert!(!rt.write(&cell, String::from("a")));
        assert_eq!(rt.version(&cell), Some(0));
        assert_eq!(rt.write_version(), 0);
    }

    #[test]
    fn never_policy_always_writes() {
        let rt = Runtime::new();
        let cell = rt.create_cell(7, Policy::never());

        assert!(rt.write(&cell, 7));
        assert!(rt.write(&cell, 7));
        assert_eq!(rt.version(&cell), Some(2));
    }

    #[test]
    fn identity_policy() {
        let rt = Runtime::new();
        let shared = Rc::new(vec![1, 2, 3]);
        let cell = rt.create_cell(shared.clone(), Policy::identity());

        // Same allocation: elided
        assert!(!rt.write(&cell, shared.clone()));
        // Equal contents, different allocation: written
        assert!(rt.write(&cell, Rc::new(vec![1, 2, 3])));
    }

    #[test]
    fn update_goes_through_policy() {
        let rt = Runtime::new();
        let cell = rt.cell(vec![1]);

        assert!(rt.update(&cell, |v| v.push(2)));
        assert_eq!(rt.read(&cell), vec![1, 2]);
        assert!(!rt.update(&cell, |_| {}));
    }

    #[test]
    fn with_borrows_without_clone() {
        let rt = Runtime::new();
        let cell = rt.cell(vec![1, 2, 3]);
        let sum = rt.with(&cell, |v| v.iter().sum::<i32>());
        assert_eq!(sum, 6);
    }

    #[test]
    fn builder_validates_initial_value() {
        let rt = Runtime::new();

        let ok = rt
            .cell_builder(3u8, Policy::structural())
            .label("small")
            .validate(|v| if *v < 10 { Ok(()) } else { Err("too big".into()) })
            .build();
        let ok = ok.expect("valid initial");
        assert_eq!(rt.label(&ok).as_deref(), Some("small"));

        let err = rt
            .cell_builder(30u8, Policy::structural())
            .label("small")
            .validate(|v| if *v < 10 { Ok(()) } else { Err("too big".into()) })
            .build();
        match err {
            Err(RuntimeError::InvalidInitial { label, reason }) => {
                assert_eq!(label, "small");
                assert_eq!(reason, "too big");
            }
            other => panic!("expected InvalidInitial, got {other:?}"),
        }
    }

    #[test]
    fn released_cell_is_stale() {
        let rt = Runtime::new();
        let cell = rt.cell(1);
        assert!(rt.release(cell));
        assert!(!rt.is_alive(&cell));
        assert!(matches!(rt.try_read(&cell), Err(RuntimeError::StaleCell(_))));
        assert!(!rt.write(&cell, 2));
        assert!(!rt.release(cell));
    }

    #[test]
    fn stale_handle_does_not_alias_new_cell() {
        let rt = Runtime::new();
        let old = rt.cell(1);
        rt.release(old);
        let new = rt.cell(2);

        assert_eq!(old.id().index, new.id().index);
        assert!(rt.try_read(&old).is_err());
        assert_eq!(rt.read(&new), 2);
    }

    #[test]
    fn old_value_dropped_after_write() {
        struct Probe(Rc<Cell<u32>>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let rt = Runtime::new();
        let cell = rt.create_cell(Probe(drops.clone()), Policy::never());
        rt.write(&cell, Probe(drops.clone()));
        assert_eq!(drops.get(), 1);
    }

    #[test]
    #[should_panic(expected = "cannot read cell")]
    fn read_of_released_cell_panics() {
        let rt = Runtime::new();
        let cell = rt.cell(1);
        rt.release(cell);
        let _ = rt.read(&cell);
    }
}
