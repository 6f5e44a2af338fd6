// ============================================================================
// spark-recompose - Tasks
// Cancellable local futures and the executor seam
// ============================================================================
//
// An effect task is a boxed local future owned by a `TaskShared`. The
// executor only ever sees a thin driver future that borrows the task future
// out of the shared slot for the duration of one poll. Cancelling takes the
// future out of the slot and drops it on the spot: once `cancel` returns the
// task's resources are released and it will never be polled again.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::{self, Either, LocalBoxFuture};
use futures::task::LocalSpawnExt;

use crate::core::context::{Runtime, WeakRuntime};
use crate::core::error::{Cancelled, RuntimeError, TimedOut};
use crate::core::types::{BoxError, ScopeId, TaskId};
use crate::primitives::cell::{read_cell, write_cell, StateCell};

// =============================================================================
// SPAWNER
// =============================================================================

/// Executor seam for effect tasks and stream subscriptions.
///
/// The runtime is single-threaded, so spawned futures are `!Send` and must
/// run on the thread that owns the runtime.
pub trait Spawner {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);
}

/// Spawns onto the current tokio `LocalSet` with `tokio::task::spawn_local`.
///
/// # Panics
///
/// Spawning panics when called outside of a `LocalSet` context.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        drop(tokio::task::spawn_local(task));
    }
}

impl Spawner for futures::executor::LocalSpawner {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        if let Err(err) = LocalSpawnExt::spawn_local(self, task) {
            tracing::warn!(error = %err, "local pool rejected task");
        }
    }
}

impl<S: Spawner + ?Sized> Spawner for Rc<S> {
    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        (**self).spawn(task)
    }
}

// =============================================================================
// CANCEL TOKEN
// =============================================================================

#[derive(Default)]
struct CancelInner {
    cancelled: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
}

/// Shared cancellation flag with a future that resolves once it is set.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Rc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Set the flag and wake everyone waiting in `cancelled()`.
    pub fn cancel(&self) {
        if self.inner.cancelled.replace(true) {
            return;
        }
        let wakers = std::mem::take(&mut *self.inner.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Resolves when the token is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + 'static {
        let inner = self.inner.clone();
        future::poll_fn(move |cx| {
            if inner.cancelled.get() {
                Poll::Ready(())
            } else {
                let mut wakers = inner.wakers.borrow_mut();
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        })
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// TASK HANDLE
// =============================================================================

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned and not finished
    Active,
    /// The future returned `Ok`
    Completed,
    /// Cancelled before finishing; the future has been dropped
    Cancelled,
    /// The future returned an error
    Failed,
}

type TaskFuture = LocalBoxFuture<'static, Result<(), BoxError>>;
type FailureHook = Box<dyn FnOnce(TaskId, BoxError)>;

struct TaskShared {
    id: TaskId,
    state: Cell<TaskState>,
    future: RefCell<Option<TaskFuture>>,
    token: CancelToken,
    driver_waker: RefCell<Option<Waker>>,
    on_failure: RefCell<Option<FailureHook>>,
}

impl TaskShared {
    fn finish(&self, result: Result<(), BoxError>) {
        if self.state.get() != TaskState::Active {
            return;
        }
        match result {
            Ok(()) => self.state.set(TaskState::Completed),
            Err(err) => {
                self.state.set(TaskState::Failed);
                let hook = self.on_failure.borrow_mut().take();
                match hook {
                    Some(hook) => hook(self.id, err),
                    None => tracing::warn!(task = %self.id, error = %err, "task failed"),
                }
            }
        }
        self.on_failure.borrow_mut().take();
    }
}

/// Handle to a spawned task. Clones share the task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Rc<TaskShared>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    /// Token observed by the task's `TaskCx`
    pub fn token(&self) -> CancelToken {
        self.shared.token.clone()
    }

    /// Cancel the task. The future is dropped before this returns.
    ///
    /// Returns false if the task had already finished or been cancelled.
    pub fn cancel(&self) -> bool {
        let shared = &self.shared;
        if shared.state.get() != TaskState::Active {
            return false;
        }
        shared.state.set(TaskState::Cancelled);
        shared.token.cancel();
        shared.on_failure.borrow_mut().take();

        // Take first, drop after the borrow ends: the future's destructors
        // may call back into the runtime.
        let future = shared.future.borrow_mut().take();
        drop(future);

        if let Some(waker) = shared.driver_waker.borrow_mut().take() {
            waker.wake();
        }
        tracing::trace!(task = %shared.id, "task cancelled");
        true
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Future handed to the executor.
struct TaskDriver {
    shared: Rc<TaskShared>,
}

impl Future for TaskDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let shared = &self.shared;
        if shared.state.get() != TaskState::Active {
            return Poll::Ready(());
        }

        let taken = shared.future.borrow_mut().take();
        let Some(mut fut) = taken else {
            return Poll::Ready(());
        };

        *shared.driver_waker.borrow_mut() = Some(cx.waker().clone());

        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                drop(fut);
                shared.driver_waker.borrow_mut().take();
                shared.finish(result);
                Poll::Ready(())
            }
            Poll::Pending => {
                // Cancelled from inside its own poll
                if shared.state.get() != TaskState::Active {
                    drop(fut);
                    return Poll::Ready(());
                }
                *shared.future.borrow_mut() = Some(fut);
                Poll::Pending
            }
        }
    }
}

/// Spawn a task future on `spawner`, returning its handle.
///
/// `on_failure` runs when the future returns an error; it never runs for a
/// cancelled task.
pub(crate) fn spawn_task(
    spawner: &dyn Spawner,
    id: TaskId,
    token: CancelToken,
    future: TaskFuture,
    on_failure: Option<FailureHook>,
) -> TaskHandle {
    let shared = Rc::new(TaskShared {
        id,
        state: Cell::new(TaskState::Active),
        future: RefCell::new(Some(future)),
        token,
        driver_waker: RefCell::new(None),
        on_failure: RefCell::new(on_failure),
    });
    spawner.spawn(Box::pin(TaskDriver {
        shared: shared.clone(),
    }));
    TaskHandle { shared }
}

// =============================================================================
// TASK CONTEXT
// =============================================================================

/// What an effect task receives: its identity, its cancellation token and a
/// weak way back into the runtime.
///
/// Writes through a `TaskCx` are dropped once the task is cancelled, so a
/// disposed scope's effects cannot touch state even through a context they
/// smuggled out.
#[derive(Clone)]
pub struct TaskCx {
    rt: WeakRuntime,
    token: CancelToken,
    task: TaskId,
    scope: ScopeId,
}

impl TaskCx {
    pub(crate) fn new(rt: WeakRuntime, token: CancelToken, task: TaskId, scope: ScopeId) -> Self {
        Self {
            rt,
            token,
            task,
            scope,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Scope that declared the effect
    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// `Err(Cancelled)` once the task was cancelled.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn runtime(&self) -> Result<Runtime, RuntimeError> {
        self.rt.upgrade().ok_or(RuntimeError::RuntimeGone)
    }

    /// Detached read of a cell.
    pub fn read<T: Clone + 'static>(&self, cell: &StateCell<T>) -> Result<T, RuntimeError> {
        let rt = self.runtime()?;
        read_cell::<T>(&rt, cell.id()).map(|(value, _)| value)
    }

    /// Write a cell unless the task was cancelled. Returns whether the write
    /// was applied.
    pub fn write<T: 'static>(&self, cell: &StateCell<T>, value: T) -> bool {
        if self.is_cancelled() {
            tracing::trace!(task = %self.task, cell = %cell.id(), "write after cancellation dropped");
            return false;
        }
        match self.rt.upgrade() {
            Some(rt) => write_cell(&rt, cell.id(), value),
            None => false,
        }
    }

    /// Read-modify-write unless cancelled.
    pub fn update<T: Clone + 'static>(&self, cell: &StateCell<T>, f: impl FnOnce(&mut T)) -> bool {
        let Ok(mut value) = self.read(cell) else {
            return false;
        };
        f(&mut value);
        self.write(cell, value)
    }

    /// Sleep for `duration`, returning early with `Cancelled` if the task is
    /// cancelled meanwhile.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.checkpoint()?;
        let sleep = pin!(tokio::time::sleep(duration));
        let cancelled = pin!(self.token.cancelled());
        match future::select(sleep, cancelled).await {
            Either::Left(((), _)) => self.checkpoint(),
            Either::Right(((), _)) => Err(Cancelled),
        }
    }

    /// Run `fut`, dropping it if it has not finished after `after`.
    pub async fn with_timeout<F: Future>(&self, after: Duration, fut: F) -> Result<F::Output, TimedOut> {
        tokio::time::timeout(after, fut)
            .await
            .map_err(|_| TimedOut { after })
    }
}

impl fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCx")
            .field("task", &self.task)
            .field("scope", &self.scope)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;

    struct DropProbe(Rc<Cell<bool>>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn task_completes() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        let handle = spawn_task(
            &spawner,
            TaskId(1),
            CancelToken::new(),
            Box::pin(async { Ok(()) }),
            None,
        );
        assert_eq!(handle.state(), TaskState::Active);
        pool.run_until_stalled();
        assert_eq!(handle.state(), TaskState::Completed);
        assert!(!handle.cancel());
    }

    #[test]
    fn cancel_drops_future_synchronously() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let dropped = Rc::new(Cell::new(false));

        let probe = DropProbe(dropped.clone());
        let handle = spawn_task(
            &spawner,
            TaskId(2),
            CancelToken::new(),
            Box::pin(async move {
                let _probe = probe;
                future::pending::<()>().await;
                Ok(())
            }),
            None,
        );
        pool.run_until_stalled();
        assert!(!dropped.get());

        assert!(handle.cancel());
        assert!(dropped.get());
        assert!(handle.token().is_cancelled());
        assert_eq!(handle.state(), TaskState::Cancelled);

        // The driver retires on its next poll
        pool.run_until_stalled();
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn cancel_before_first_poll() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();

        let handle = spawn_task(
            &spawner,
            TaskId(3),
            CancelToken::new(),
            Box::pin(async move {
                ran_clone.set(true);
                Ok(())
            }),
            None,
        );
        handle.cancel();
        pool.run_until_stalled();
        assert!(!ran.get());
    }

    #[test]
    fn failure_hook_receives_error() {
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let seen = Rc::new(RefCell::new(None));
        let seen_clone = seen.clone();

        let handle = spawn_task(
            &spawner,
            TaskId(4),
            CancelToken::new(),
            Box::pin(async { Err("boom".into()) }),
            Some(Box::new(move |id, err| {
                *seen_clone.borrow_mut() = Some((id, err.to_string()));
            })),
        );
        pool.run_until_stalled();

        assert_eq!(handle.state(), TaskState::Failed);
        assert_eq!(*seen.borrow(), Some((TaskId(4), "boom".to_string())));
    }

    #[test]
    fn token_wakes_waiters() {
        let mut pool = LocalPool::new();
        let token = CancelToken::new();
        let woke = Rc::new(Cell::new(false));

        let waiter = token.cancelled();
        let woke_clone = woke.clone();
        pool.spawner()
            .spawn_local(async move {
                waiter.await;
                woke_clone.set(true);
            })
            .unwrap();

        pool.run_until_stalled();
        assert!(!woke.get());
        token.cancel();
        pool.run_until_stalled();
        assert!(woke.get());
    }

    #[test]
    fn task_cx_writes_are_guarded() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        let token = CancelToken::new();
        let cx = TaskCx::new(
            rt.downgrade(),
            token.clone(),
            TaskId(5),
            ScopeId {
                index: 0,
                generation: 0,
            },
        );

        assert!(cx.write(&cell, 1));
        assert_eq!(cx.read(&cell).unwrap(), 1);

        token.cancel();
        assert!(!cx.write(&cell, 2));
        assert_eq!(rt.read(&cell), 1);
        assert_eq!(cx.checkpoint(), Err(Cancelled));
    }

    #[test]
    fn task_cx_after_runtime_drop() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        let cx = TaskCx::new(
            rt.downgrade(),
            CancelToken::new(),
            TaskId(6),
            ScopeId {
                index: 0,
                generation: 0,
            },
        );
        drop(rt);

        assert!(matches!(cx.read(&cell), Err(RuntimeError::RuntimeGone)));
        assert!(!cx.write(&cell, 1));
    }
}
