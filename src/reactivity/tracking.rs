// ============================================================================
// spark-recompose - Dependency Tracking
// Which scope read which cell, in both directions
// ============================================================================
//
// The tracker keeps, per scope, the exact set of cells read on its most recent
// run, plus the inverted index cell -> observing scopes. A run collects its
// reads on the side (in the Composer) and the tracker swaps the whole set in
// when the run ends, so edges to cells the scope stopped reading disappear
// at the same moment the new edges appear.
// ============================================================================

use std::collections::{HashMap, HashSet};

use crate::core::types::{CellId, ScopeId};

// =============================================================================
// TRACKER
// =============================================================================

#[derive(Default)]
pub(crate) struct Tracker {
    /// scope -> cells read on its most recent run
    reads: HashMap<ScopeId, HashSet<CellId>>,
    /// cell -> scopes that read it on their most recent run
    observers: HashMap<CellId, HashSet<ScopeId>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a scope's read set with the set collected during its run.
    pub fn replace_reads(&mut self, scope: ScopeId, new_reads: HashSet<CellId>) {
        let old_reads = self.reads.remove(&scope).unwrap_or_default();

        // Drop edges to cells no longer read
        for cell in old_reads.difference(&new_reads) {
            self.unlink(*cell, scope);
        }

        // Add edges to newly read cells
        for cell in new_reads.difference(&old_reads) {
            self.observers.entry(*cell).or_default().insert(scope);
        }

        if !new_reads.is_empty() {
            self.reads.insert(scope, new_reads);
        }
    }

    /// Add reads without dropping any existing edge.
    ///
    /// Used when a run failed part-way: the scope keeps observing what it read
    /// before as well as what it got to read this time.
    pub fn merge_reads(&mut self, scope: ScopeId, extra: HashSet<CellId>) {
        if extra.is_empty() {
            return;
        }
        for cell in &extra {
            self.observers.entry(*cell).or_default().insert(scope);
        }
        self.reads.entry(scope).or_default().extend(extra);
    }

    /// Scopes observing `cell`, in deterministic order.
    pub fn observers_of(&self, cell: CellId) -> Vec<ScopeId> {
        let mut scopes: Vec<ScopeId> = self
            .observers
            .get(&cell)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        scopes.sort();
        scopes
    }

    /// Whether `scope` read `cell` on its most recent run.
    pub fn is_observing(&self, scope: ScopeId, cell: CellId) -> bool {
        self.reads
            .get(&scope)
            .is_some_and(|reads| reads.contains(&cell))
    }

    /// Number of cells read by a scope on its most recent run.
    pub fn read_count(&self, scope: ScopeId) -> usize {
        self.reads.get(&scope).map_or(0, HashSet::len)
    }

    /// Number of scopes observing a cell.
    pub fn observer_count(&self, cell: CellId) -> usize {
        self.observers.get(&cell).map_or(0, HashSet::len)
    }

    /// Forget a disposed scope.
    pub fn remove_scope(&mut self, scope: ScopeId) {
        if let Some(reads) = self.reads.remove(&scope) {
            for cell in reads {
                self.unlink(cell, scope);
            }
        }
    }

    /// Forget a released cell.
    pub fn remove_cell(&mut self, cell: CellId) {
        if let Some(scopes) = self.observers.remove(&cell) {
            for scope in scopes {
                if let Some(reads) = self.reads.get_mut(&scope) {
                    reads.remove(&cell);
                    if reads.is_empty() {
                        self.reads.remove(&scope);
                    }
                }
            }
        }
    }

    /// Total number of (scope, cell) edges.
    pub fn edge_count(&self) -> usize {
        self.reads.values().map(HashSet::len).sum()
    }

    fn unlink(&mut self, cell: CellId, scope: ScopeId) {
        if let Some(scopes) = self.observers.get_mut(&cell) {
            scopes.remove(&scope);
            if scopes.is_empty() {
                self.observers.remove(&cell);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
