// ============================================================================
// spark-recompose - Recomposition Scheduling
// Batches invalidations and re-runs the minimal set of scopes
// ============================================================================
//
// State machine:
//
//   Idle --write--> Collecting --flush--> Running --done--> Idle
//                       ^                    \----error--> Failed
//                       \--error, scopes not reached yet---/
//
// A write marks the observing scopes pending. A pass takes a snapshot of the
// pending set, sorts it by (depth, creation order) and re-runs each live scope
// at most once. Parents run before their children, and a child re-run by its
// parent is skipped when its own turn comes. Anything invalidated while a
// pass is running is collected for the next pass; the scheduler never runs a
// pass from inside a pass.
//
// In deferred mode passes run when the host calls `flush` or awaits `drive`.
// In immediate mode a pass also runs right after every write made outside of
// a batch and outside of a pass.
// ============================================================================

use std::collections::HashSet;
use std::task::{Poll, Waker};

use futures::future;

use crate::core::constants::{CLEAN, INVALID, STATUS_MASK};
use crate::core::context::{FlushMode, Runtime};
use crate::core::error::RuntimeError;
use crate::core::types::ScopeId;
use crate::primitives::scope::{run_scope, scope_path};

// =============================================================================
// STATE
// =============================================================================

/// Phase of the recomposition state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassPhase {
    /// Nothing pending
    Idle,
    /// Invalidations pending, a pass is due
    Collecting,
    /// A pass is executing
    Running,
    /// The last pass ended with an error
    Failed,
}

/// Summary of a `flush`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Passes executed
    pub passes: usize,
    /// Scope runs, counting children re-run by their parents
    pub scopes_run: usize,
    /// Scopes disposed because their parent stopped producing them
    pub scopes_disposed: usize,
}

pub(crate) struct SchedulerState {
    phase: PassPhase,
    pending: HashSet<ScopeId>,
    /// Invalidations of paused compositions
    held: HashSet<ScopeId>,
    ran_this_pass: HashSet<ScopeId>,
    side_effects: Vec<Box<dyn FnOnce()>>,
    pass_id: u64,
    runs: usize,
    disposals: usize,
    driver: Option<Waker>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            phase: PassPhase::Idle,
            pending: HashSet::new(),
            held: HashSet::new(),
            ran_this_pass: HashSet::new(),
            side_effects: Vec::new(),
            pass_id: 0,
            runs: 0,
            disposals: 0,
            driver: None,
        }
    }

    fn wake_driver(&mut self) {
        if let Some(waker) = self.driver.take() {
            waker.wake();
        }
    }
}

impl Drop for SchedulerState {
    fn drop(&mut self) {
        // Lets a parked `drive` future observe that the runtime is gone
        self.wake_driver();
    }
}

// =============================================================================
// INVALIDATION
// =============================================================================

/// Mark scopes pending. Runs a pass right away in immediate mode when outside
/// of a batch and outside of a pass.
pub(crate) fn invalidate(rt: &Runtime, scopes: &[ScopeId]) {
    if scopes.is_empty() {
        return;
    }

    let run_now = {
        let mut table = rt.inner.scopes.borrow_mut();
        let mut sched = rt.inner.scheduler.borrow_mut();
        for &scope in scopes {
            if !table.contains(scope) {
                continue;
            }
            if table.is_held(scope) {
                sched.held.insert(scope);
            } else {
                sched.pending.insert(scope);
            }
            if let Some(rec) = table.get_mut(scope) {
                let flags = rec.flags();
                rec.set_flags((flags & STATUS_MASK) | INVALID);
            }
        }

        if !sched.pending.is_empty() && matches!(sched.phase, PassPhase::Idle | PassPhase::Failed) {
            sched.phase = PassPhase::Collecting;
            sched.wake_driver();
        }

        sched.phase == PassPhase::Collecting
            && rt.inner.config.flush_mode == FlushMode::Immediate
            && rt.inner.batch_depth.get() == 0
    };

    if run_now {
        flush_and_record(rt);
    }
}

/// Flush, keeping any error in the diagnostics. Used where there is no caller
/// to return the error to.
pub(crate) fn flush_and_record(rt: &Runtime) {
    for _ in 0..rt.inner.config.max_passes {
        let err = match flush(rt) {
            Ok(_) => return,
            Err(err) => err,
        };
        let retry = matches!(err, RuntimeError::RecompositionFailure { .. });
        tracing::error!(error = %err, "recomposition failed");
        rt.inner.record(err);

        // The failed scope is not requeued; only what the pass never reached
        if !retry || rt.inner.scheduler.borrow().phase != PassPhase::Collecting {
            return;
        }
    }
}

pub(crate) fn mark_ran(rt: &Runtime, scope: ScopeId) {
    let mut sched = rt.inner.scheduler.borrow_mut();
    sched.ran_this_pass.insert(scope);
    sched.runs += 1;
}

/// Forget a disposed scope.
pub(crate) fn forget(rt: &Runtime, scope: ScopeId) {
    let mut sched = rt.inner.scheduler.borrow_mut();
    sched.pending.remove(&scope);
    sched.held.remove(&scope);
    sched.disposals += 1;
}

pub(crate) fn queue_side_effects(rt: &Runtime, effects: Vec<Box<dyn FnOnce()>>) {
    if effects.is_empty() {
        return;
    }
    rt.inner.scheduler.borrow_mut().side_effects.extend(effects);
}

/// Move the held invalidations of a resumed composition back to pending.
pub(crate) fn release_held(rt: &Runtime, root: ScopeId) {
    let released: Vec<ScopeId> = {
        let table = rt.inner.scopes.borrow();
        let mut sched = rt.inner.scheduler.borrow_mut();
        let released: Vec<ScopeId> = sched
            .held
            .iter()
            .copied()
            .filter(|scope| table.get(*scope).is_some_and(|rec| rec.root() == root))
            .collect();
        for scope in &released {
            sched.held.remove(scope);
        }
        released
    };
    invalidate(rt, &released);
}

// =============================================================================
// PASSES
// =============================================================================

/// Run the first composition of a root outside of the pass loop.
pub(crate) fn run_initial(rt: &Runtime, root: ScopeId) -> Result<(), RuntimeError> {
    let outer = {
        let mut sched = rt.inner.scheduler.borrow_mut();
        let previous = sched.phase;
        if previous != PassPhase::Running {
            sched.phase = PassPhase::Running;
            sched.ran_this_pass.clear();
        }
        previous
    };
    let pass = rt.inner.scheduler.borrow().pass_id;

    let result = run_scope(rt, root, pass);

    if outer == PassPhase::Running {
        // Composed from inside a pass; that pass owns the side effects
        return result;
    }

    let side_effects = {
        let mut sched = rt.inner.scheduler.borrow_mut();
        sched.phase = if sched.pending.is_empty() {
            if outer == PassPhase::Failed {
                PassPhase::Failed
            } else {
                PassPhase::Idle
            }
        } else {
            PassPhase::Collecting
        };
        let side_effects = std::mem::take(&mut sched.side_effects);
        if result.is_err() {
            Vec::new()
        } else {
            side_effects
        }
    };
    for effect in side_effects {
        effect();
    }

    result?;

    let run_now = {
        let sched = rt.inner.scheduler.borrow();
        sched.phase == PassPhase::Collecting
            && rt.inner.config.flush_mode == FlushMode::Immediate
            && rt.inner.batch_depth.get() == 0
    };
    if run_now {
        flush(rt)?;
    }
    Ok(())
}

/// Run passes until nothing is pending.
pub(crate) fn flush(rt: &Runtime) -> Result<PassReport, RuntimeError> {
    let (runs_before, disposals_before) = {
        let sched = rt.inner.scheduler.borrow();
        if sched.phase == PassPhase::Running {
            // Already inside a pass; the running flush picks up new work
            return Ok(PassReport::default());
        }
        (sched.runs, sched.disposals)
    };

    let mut report = PassReport::default();
    let max_passes = rt.inner.config.max_passes;

    let result = loop {
        let snapshot = {
            let mut sched = rt.inner.scheduler.borrow_mut();
            if sched.pending.is_empty() {
                sched.phase = PassPhase::Idle;
                break Ok(());
            }
            if report.passes >= max_passes {
                sched.phase = PassPhase::Failed;
                let stuck: Vec<ScopeId> = sched.pending.iter().copied().collect();
                drop(sched);
                break Err(overflow(rt, max_passes, stuck));
            }
            sched.phase = PassPhase::Running;
            sched.pass_id += 1;
            sched.ran_this_pass.clear();
            std::mem::take(&mut sched.pending)
        };

        match run_pass(rt, snapshot) {
            Ok(()) => report.passes += 1,
            Err(err) => {
                report.passes += 1;
                break Err(err);
            }
        }
    };

    let sched = rt.inner.scheduler.borrow();
    report.scopes_run = sched.runs - runs_before;
    report.scopes_disposed = sched.disposals - disposals_before;
    drop(sched);

    result.map(|()| report)
}

fn overflow(rt: &Runtime, passes: usize, stuck: Vec<ScopeId>) -> RuntimeError {
    let mut stuck = stuck;
    stuck.sort();
    let scopes = stuck.into_iter().map(|id| scope_path(rt, id)).collect();
    tracing::debug!(passes, "recomposition did not settle");
    RuntimeError::ReentrantWriteOverflow { passes, scopes }
}

/// One pass over a snapshot of the pending set.
fn run_pass(rt: &Runtime, snapshot: HashSet<ScopeId>) -> Result<(), RuntimeError> {
    let pass = rt.inner.scheduler.borrow().pass_id;
    let span = tracing::debug_span!("pass", pass);
    let _enter = span.enter();

    let mut order: Vec<((u32, u64), ScopeId)> = {
        let table = rt.inner.scopes.borrow();
        snapshot
            .into_iter()
            .filter_map(|id| table.get(id).map(|rec| (rec.order(), id)))
            .collect()
    };
    order.sort();
    tracing::debug!(pending = order.len(), "pass started");

    for (position, &(_, scope)) in order.iter().enumerate() {
        let runnable = {
            let mut table = rt.inner.scopes.borrow_mut();
            let mut sched = rt.inner.scheduler.borrow_mut();
            if sched.ran_this_pass.contains(&scope) || !table.contains(scope) {
                false
            } else if table.is_held(scope) {
                sched.held.insert(scope);
                false
            } else if table.needs_run(scope, &rt.inner.cells.borrow()) {
                true
            } else {
                // Every change it saw was already caught up with
                if let Some(rec) = table.get_mut(scope) {
                    let flags = rec.flags();
                    rec.set_flags((flags & STATUS_MASK) | CLEAN);
                }
                false
            }
        };
        if !runnable {
            continue;
        }

        if let Err(err) = run_scope(rt, scope, pass) {
            requeue_aborted(rt, &order[position + 1..]);
            let mut sched = rt.inner.scheduler.borrow_mut();
            sched.side_effects.clear();
            if sched.pending.is_empty() {
                sched.phase = PassPhase::Failed;
            } else {
                // Scopes the pass never reached are due in the next one
                sched.phase = PassPhase::Collecting;
                sched.wake_driver();
            }
            tracing::debug!(%scope, error = %err, "pass failed");
            return Err(err);
        }
    }

    let side_effects = std::mem::take(&mut rt.inner.scheduler.borrow_mut().side_effects);
    for effect in side_effects {
        effect();
    }

    tracing::debug!("pass finished");
    Ok(())
}

/// Scopes of a failed pass that never got their turn stay pending.
fn requeue_aborted(rt: &Runtime, rest: &[((u32, u64), ScopeId)]) {
    let table = rt.inner.scopes.borrow();
    let mut sched = rt.inner.scheduler.borrow_mut();
    for &(_, scope) in rest {
        if table.contains(scope) && !sched.ran_this_pass.contains(&scope) {
            sched.pending.insert(scope);
        }
    }
}

// =============================================================================
// PUBLIC API
// =============================================================================

impl Runtime {
    /// Run recomposition passes until nothing is pending.
    ///
    /// Returns the first error that aborted a pass. Scopes the failed pass did
    /// not reach stay pending for the next flush.
    pub fn flush(&self) -> Result<PassReport, RuntimeError> {
        flush(self)
    }

    /// Current phase of the scheduler
    pub fn phase(&self) -> PassPhase {
        self.inner.scheduler.borrow().phase
    }

    /// Number of scopes waiting for the next pass
    pub fn pending_count(&self) -> usize {
        self.inner.scheduler.borrow().pending.len()
    }

    /// Number of invalidations held by paused compositions
    pub fn held_count(&self) -> usize {
        self.inner.scheduler.borrow().held.len()
    }

    /// Id of the most recent pass
    pub fn pass_id(&self) -> u64 {
        self.inner.scheduler.borrow().pass_id
    }

    /// Drive recomposition from an async host: wait for pending
    /// invalidations, flush, repeat.
    ///
    /// Recomposition failures are logged and kept in the diagnostics; the
    /// loop carries on with the next write. The future completes once the
    /// runtime is dropped.
    ///
    /// ```ignore
    /// let local = tokio::task::LocalSet::new();
    /// local.spawn_local(rt.drive());
    /// ```
    pub fn drive(&self) -> impl std::future::Future<Output = ()> + 'static {
        let weak = self.downgrade();
        async move {
            loop {
                let due = future::poll_fn(|cx| {
                    let Some(rt) = weak.upgrade() else {
                        return Poll::Ready(false);
                    };
                    let mut sched = rt.inner.scheduler.borrow_mut();
                    if sched.phase == PassPhase::Collecting {
                        Poll::Ready(true)
                    } else {
                        sched.driver = Some(cx.waker().clone());
                        Poll::Pending
                    }
                })
                .await;

                if !due {
                    break;
                }
                if let Some(rt) = weak.upgrade() {
                    flush_and_record(&rt);
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
