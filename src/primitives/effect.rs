// ============================================================================
// spark-recompose - Effect Lifecycle
// Keyed, cancellable work attached to a scope
// ============================================================================
//
// Every effect declaration in a run is matched against the record left at the
// same declaration site by the previous run:
//
//   - no record        -> start
//   - equal key tuple  -> keep the record untouched
//   - different keys   -> cancel the old task (synchronously), then start
//
// Records that a run does not declare again are cancelled when the run ends.
// Disposing a scope cancels every record it owns before the disposal returns.
// ============================================================================

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::Location;

use crate::core::context::Runtime;
use crate::core::error::RuntimeError;
use crate::core::types::{BoxError, ScopeId, SlotKey, TaskId};
use crate::primitives::scope::Composer;
use crate::primitives::task::{spawn_task, CancelToken, TaskCx, TaskHandle, TaskState};
use crate::reactivity::equality::{Identity, Policy};

// =============================================================================
// KEY TUPLES
// =============================================================================

/// Values an effect can be keyed on.
///
/// Implemented for every `PartialEq + Debug + 'static` type, which covers
/// tuples of keys and `()` (never restart). Wrap a field in `Key` to compare
/// it with something other than `PartialEq`.
pub trait EffectKeys: 'static {
    /// Whether `previous` holds an equal key tuple of the same type
    fn same_keys(&self, previous: &dyn Any) -> bool;

    /// Rendering used in logs and failure reports
    fn describe(&self) -> String;

    fn as_any(&self) -> &dyn Any;
}

impl<T: PartialEq + fmt::Debug + 'static> EffectKeys for T {
    fn same_keys(&self, previous: &dyn Any) -> bool {
        previous.downcast_ref::<T>().is_some_and(|prev| prev == self)
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One key field with an explicit equality policy.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use spark_recompose::Key;
///
/// let config = Rc::new(vec![1, 2, 3]);
///
/// // Same allocation: equal
/// assert_eq!(Key::identity(config.clone()), Key::identity(config.clone()));
/// // Equal contents, new allocation: a different key
/// assert_ne!(Key::identity(config), Key::identity(Rc::new(vec![1, 2, 3])));
/// ```
pub struct Key<T> {
    value: T,
    policy: Policy<T>,
}

impl<T> Key<T> {
    pub fn new(value: T, policy: Policy<T>) -> Self {
        Self { value, policy }
    }

    pub fn structural(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new(value, Policy::structural())
    }

    pub fn identity(value: T) -> Self
    where
        T: Identity,
    {
        Self::new(value, Policy::identity())
    }

    pub fn custom(value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self::new(value, Policy::custom(equals))
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.policy.equals(&other.value, &self.value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.value, self.policy.name())
    }
}

// =============================================================================
// EFFECT RECORD
// =============================================================================

pub(crate) enum EffectKind {
    /// Async task started by `launched_effect`
    Task(TaskHandle),
    /// Cleanup registered by `disposable_effect`
    Disposable(Option<Box<dyn FnOnce()>>),
}

/// (key tuple, running work) owned by a scope at one declaration site.
///
/// Dropping the record cancels the work.
pub(crate) struct EffectRecord {
    keys: Box<dyn EffectKeys>,
    kind: EffectKind,
}

impl EffectRecord {
    fn is_task(&self) -> bool {
        matches!(self.kind, EffectKind::Task(_))
    }

    pub(crate) fn task(&self) -> Option<&TaskHandle> {
        match &self.kind {
            EffectKind::Task(handle) => Some(handle),
            EffectKind::Disposable(_) => None,
        }
    }
}

impl Drop for EffectRecord {
    fn drop(&mut self) {
        match &mut self.kind {
            EffectKind::Task(handle) => {
                handle.cancel();
            }
            EffectKind::Disposable(cleanup) => {
                if let Some(cleanup) = cleanup.take() {
                    cleanup();
                }
            }
        }
    }
}

// =============================================================================
// DECLARATIONS
// =============================================================================

impl Composer<'_> {
    /// Run an async task keyed on `keys`.
    ///
    /// The task starts on the first run that declares it, restarts whenever
    /// the keys change, and is cancelled when a run stops declaring it or the
    /// scope is disposed. Returns the handle of the live task.
    ///
    /// ```ignore
    /// cx.launched_effect(user_id, move |task| async move {
    ///     let profile = load_profile(user_id).await?;
    ///     task.write(&profile_cell, Some(profile));
    ///     Ok(())
    /// });
    /// ```
    #[track_caller]
    pub fn launched_effect<K, F, Fut>(&mut self, keys: K, task: F) -> TaskHandle
    where
        K: EffectKeys,
        F: FnOnce(TaskCx) -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + 'static,
    {
        let slot = self.next_slot(Location::caller(), None);

        if let Some(previous) = self.take_effect(&slot) {
            match previous.task().cloned() {
                Some(handle) if keys.same_keys(previous.keys.as_any()) => {
                    self.keep_effect(slot, previous);
                    return handle;
                }
                _ => {
                    tracing::debug!(
                        scope = %self.scope_id(),
                        site = %slot,
                        from = %previous.keys.describe(),
                        to = %keys.describe(),
                        "effect keys changed, restarting"
                    );
                    // Cancels before the replacement starts
                    drop(previous);
                }
            }
        }

        let handle = self.start_task(&slot, &keys, task);
        self.keep_effect(
            slot,
            EffectRecord {
                keys: Box::new(keys),
                kind: EffectKind::Task(handle.clone()),
            },
        );
        handle
    }

    /// Run `setup` when the keys first appear or change; the cleanup it
    /// returns runs before the next setup and when the scope goes away.
    #[track_caller]
    pub fn disposable_effect<K, S, C>(&mut self, keys: K, setup: S)
    where
        K: EffectKeys,
        S: FnOnce() -> C,
        C: FnOnce() + 'static,
    {
        let slot = self.next_slot(Location::caller(), None);

        if let Some(previous) = self.take_effect(&slot) {
            if !previous.is_task() && keys.same_keys(previous.keys.as_any()) {
                self.keep_effect(slot, previous);
                return;
            }
            drop(previous);
        }

        let cleanup = setup();
        self.keep_effect(
            slot,
            EffectRecord {
                keys: Box::new(keys),
                kind: EffectKind::Disposable(Some(Box::new(cleanup))),
            },
        );
    }

    fn start_task<K, F, Fut>(&mut self, slot: &SlotKey, keys: &K, task: F) -> TaskHandle
    where
        K: EffectKeys,
        F: FnOnce(TaskCx) -> Fut,
        Fut: Future<Output = Result<(), BoxError>> + 'static,
    {
        let rt = self.runtime().clone();
        let id = rt.inner.allocate_task_id();
        let scope = self.scope_id();
        let token = CancelToken::new();

        let cx = TaskCx::new(rt.downgrade(), token.clone(), id, scope);
        let future = Box::pin(task(cx));

        let weak = rt.downgrade();
        let site = slot.to_string();
        let described = keys.describe();
        let on_failure = Box::new(move |task: TaskId, source: BoxError| {
            report_task_failure(weak.upgrade(), task, scope, site, described, source);
        });

        tracing::debug!(task = %id, scope = %scope, site = %slot, "effect started");
        spawn_task(&*rt.spawner(), id, token, future, Some(on_failure))
    }
}

fn report_task_failure(
    rt: Option<Runtime>,
    task: TaskId,
    scope: ScopeId,
    site: String,
    keys: String,
    source: BoxError,
) {
    let error = RuntimeError::EffectTaskFailure {
        task,
        scope,
        site,
        keys,
        source,
    };
    tracing::warn!(%task, %scope, error = %error, "effect task failed");
    if let Some(rt) = rt {
        rt.inner.record(error);
    }
}

/// Snapshot of one effect record, for hosts and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectInfo {
    pub site: String,
    pub keys: String,
    pub task: Option<TaskId>,
    pub state: Option<TaskState>,
}

impl EffectInfo {
    pub(crate) fn of(slot: &SlotKey, record: &EffectRecord) -> Self {
        Self {
            site: slot.to_string(),
            keys: record.keys.describe(),
            task: record.task().map(TaskHandle::id),
            state: record.task().map(TaskHandle::state),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn blanket_keys_compare_by_value_and_type() {
        let a: Box<dyn EffectKeys> = Box::new((1, "x"));
        assert!((1, "x").same_keys(a.as_any()));
        assert!(!(2, "x").same_keys(a.as_any()));
        // Same debug text, different type
        assert!(!1u8.same_keys(&1u16 as &dyn Any));
        assert!(().same_keys(&() as &dyn Any));
    }

    #[test]
    fn key_policy_per_field() {
        let shared = Rc::new(String::from("cfg"));

        let by_identity = (1, Key::identity(shared.clone()));
        let prev: Box<dyn EffectKeys> = Box::new(by_identity);

        assert!((1, Key::identity(shared.clone())).same_keys(prev.as_any()));
        assert!(!(1, Key::identity(Rc::new(String::from("cfg")))).same_keys(prev.as_any()));
        assert!(!(2, Key::identity(shared)).same_keys(prev.as_any()));
    }

    #[test]
    fn key_custom_policy() {
        let a = Key::custom(10.4_f64, |x, y| x.round() == y.round());
        let b = Key::custom(10.3_f64, |x, y| x.round() == y.round());
        assert_eq!(a, b);
        assert_eq!(format!("{:?}", a), "10.4@custom");
    }

    #[test]
    fn describe_uses_debug() {
        assert_eq!((1, "a").describe(), "(1, \"a\")");
    }
}
