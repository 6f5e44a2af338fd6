// ============================================================================
// spark-recompose - Type Definitions
// Stable identifiers, slot keys and the generational arena
// ============================================================================
//
// Cells and scopes live in arenas indexed by (index, generation) pairs. A
// handle whose generation no longer matches its slot is stale: the thing it
// named was released and the slot may already hold something else.
// ============================================================================

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// ERROR ALIASES
// =============================================================================

/// Boxed error returned by scope bodies, effect tasks and flow producers.
///
/// Any `std::error::Error` (and plain strings) converts into it with `?` or
/// `.into()`.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Equality function for values of type T
pub type EqualsFn<T> = fn(&T, &T) -> bool;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identity of a state cell in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct CellId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}.{}", self.index, self.generation)
    }
}

/// Identity of a scope in the scope tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ScopeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}.{}", self.index, self.generation)
    }
}

/// Identity of a spawned task. Never reused within one process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TaskId(pub(crate) u64);

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// =============================================================================
// SLOT KEYS
// =============================================================================

/// Position of a child scope, effect or remembered value inside its parent.
///
/// Made of the declaring call-site, an optional explicit key and the number of
/// earlier declarations with the same (site, key) in the same run. Two runs
/// that declare things in the same places produce the same slot keys, which is
/// what lets a re-run reuse its previous children and effects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotKey {
    pub(crate) site: &'static Location<'static>,
    pub(crate) key: Option<u64>,
    pub(crate) occurrence: u32,
}

impl SlotKey {
    /// Call-site that declared the slot
    pub fn site(&self) -> &'static Location<'static> {
        self.site
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site.file(), self.site.line())?;
        if let Some(key) = self.key {
            write!(f, "[key={:x}]", key)?;
        }
        if self.occurrence > 0 {
            write!(f, "#{}", self.occurrence)?;
        }
        Ok(())
    }
}

/// Hash an explicit slot key down to the u64 stored in a `SlotKey`.
pub(crate) fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// GENERATIONAL ARENA
// =============================================================================

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena allocator with generation-checked handles.
///
/// Freed slots are reused; each reuse bumps the slot's generation so that old
/// handles stop resolving.
pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value, returning its (index, generation).
    pub fn insert(&mut self, value: T) -> (u32, u32) {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.value = Some(value);
            (index, entry.generation)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                value: Some(value),
            });
            (index, 0)
        }
    }

    pub fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.entries
            .get(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_ref())
    }

    pub fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.entries
            .get_mut(index as usize)
            .filter(|e| e.generation == generation)
            .and_then(|e| e.value.as_mut())
    }

    /// Remove a value; the slot goes on the free list.
    pub fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let entry = self.entries.get_mut(index as usize)?;
        if entry.generation != generation {
            return None;
        }
        let value = entry.value.take()?;
        self.free_list.push(index);
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, index: u32, generation: u32) -> bool {
        self.get(index, generation).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
