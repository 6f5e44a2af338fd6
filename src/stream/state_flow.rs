// ============================================================================
// spark-recompose - State Flows
// Hot holder of a current value
// ============================================================================
//
// A state flow always has a value. Setting an equal value (under the flow's
// equality policy) is suppressed. Subscribers see the current value first,
// then changes; a slow subscriber skips straight to the newest value.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::stream::{Stream, StreamExt};

use crate::reactivity::equality::Policy;
use crate::stream::flow::Flow;

struct StateInner<T> {
    label: RefCell<Rc<str>>,
    value: RefCell<T>,
    version: Cell<u64>,
    policy: Policy<T>,
    /// One parked waker per pending subscription, keyed by subscription id
    waiters: RefCell<BTreeMap<u64, Waker>>,
    next_subscription: Cell<u64>,
    subscriptions: Cell<usize>,
}

impl<T> StateInner<T> {
    fn wake_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters.into_values() {
            waker.wake();
        }
    }
}

// =============================================================================
// MUTABLE STATE FLOW
// =============================================================================

/// Writable state flow. Clones share the same state.
///
/// # Example
///
/// ```
/// use futures::executor::block_on;
/// use futures::StreamExt;
/// use spark_recompose::stream::MutableStateFlow;
///
/// let volume = MutableStateFlow::new(3);
/// let mut updates = volume.subscribe();
///
/// assert_eq!(block_on(updates.next()), Some(3));
/// assert!(volume.set(7));
/// assert!(!volume.set(7)); // equal value, suppressed
/// assert_eq!(block_on(updates.next()), Some(7));
/// ```
pub struct MutableStateFlow<T> {
    inner: Rc<StateInner<T>>,
}

impl<T> Clone for MutableStateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> MutableStateFlow<T> {
    /// State flow with structural equality.
    pub fn new(initial: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_policy(initial, Policy::structural())
    }

    pub fn with_policy(initial: T, policy: Policy<T>) -> Self {
        Self {
            inner: Rc::new(StateInner {
                label: RefCell::new(Rc::from("state")),
                value: RefCell::new(initial),
                version: Cell::new(0),
                policy,
                waiters: RefCell::new(BTreeMap::new()),
                next_subscription: Cell::new(0),
                subscriptions: Cell::new(0),
            }),
        }
    }

    /// Set the label used by `as_flow` and in logs.
    pub fn named(self, label: impl Into<Rc<str>>) -> Self {
        *self.inner.label.borrow_mut() = label.into();
        self
    }

    /// Replace the value. Returns false (and notifies nobody) when the new
    /// value equals the current one.
    pub fn set(&self, value: T) -> bool {
        {
            let current = self.inner.value.borrow();
            if self.inner.policy.equals(&current, &value) {
                return false;
            }
        }
        drop(self.inner.value.replace(value));
        self.inner.version.set(self.inner.version.get() + 1);
        tracing::trace!(
            state = %self.inner.label.borrow(),
            version = self.inner.version.get(),
            "state flow updated"
        );
        self.inner.wake_all();
        true
    }

    /// Set the value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = f(&self.inner.value.borrow());
        self.set(next)
    }

    pub fn value(&self) -> T {
        self.as_state_flow().value()
    }

    pub fn subscribe(&self) -> StateSubscription<T> {
        self.as_state_flow().subscribe()
    }

    pub fn as_flow(&self) -> Flow<T> {
        self.as_state_flow().as_flow()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.get()
    }

    /// Read-only view of the same state.
    pub fn as_state_flow(&self) -> StateFlow<T> {
        StateFlow {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for MutableStateFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableStateFlow")
            .field("label", &&**self.inner.label.borrow())
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

// =============================================================================
// STATE FLOW (read-only)
// =============================================================================

/// Read-only state flow.
pub struct StateFlow<T> {
    inner: Rc<StateInner<T>>,
}

impl<T> Clone for StateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> StateFlow<T> {
    /// Current value
    pub fn value(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Number of accepted updates since creation
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    pub fn label(&self) -> Rc<str> {
        self.inner.label.borrow().clone()
    }

    /// Stream of the current value followed by every later change.
    ///
    /// Never ends on its own; drop it to unsubscribe.
    pub fn subscribe(&self) -> StateSubscription<T> {
        let id = self.inner.next_subscription.get();
        self.inner.next_subscription.set(id + 1);
        self.inner.subscriptions.set(self.inner.subscriptions.get() + 1);
        StateSubscription {
            inner: self.inner.clone(),
            id,
            seen: None,
        }
    }

    /// Cold view: every collection subscribes anew.
    pub fn as_flow(&self) -> Flow<T> {
        let state = self.clone();
        Flow::labeled(self.label(), move |_| state.subscribe().map(Ok).boxed_local())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.get()
    }
}

impl<T: fmt::Debug> fmt::Debug for StateFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFlow")
            .field("label", &&**self.inner.label.borrow())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Live subscription to a state flow.
pub struct StateSubscription<T> {
    inner: Rc<StateInner<T>>,
    id: u64,
    seen: Option<u64>,
}

impl<T: Clone> Stream for StateSubscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let version = self.inner.version.get();
        if self.seen != Some(version) {
            self.seen = Some(version);
            return Poll::Ready(Some(self.inner.value.borrow().clone()));
        }
        let mut waiters = self.inner.waiters.borrow_mut();
        match waiters.get_mut(&self.id) {
            Some(parked) if parked.will_wake(cx.waker()) => {}
            Some(parked) => parked.clone_from(cx.waker()),
            None => {
                waiters.insert(self.id, cx.waker().clone());
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for StateSubscription<T> {
    fn drop(&mut self) {
        self.inner.waiters.borrow_mut().remove(&self.id);
        let count = self.inner.subscriptions.get();
        self.inner.subscriptions.set(count.saturating_sub(1));
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;

    #[test]
    fn new_subscriber_sees_current_value() {
        let state = MutableStateFlow::new("idle");
        state.set("loading");

        let mut sub = state.subscribe();
        assert_eq!(block_on(sub.next()), Some("loading"));
        assert_eq!(state.subscription_count(), 1);
        drop(sub);
        assert_eq!(state.subscription_count(), 0);
    }

    #[test]
    fn equal_values_are_suppressed() {
        let state = MutableStateFlow::new(1);
        assert!(!state.set(1));
        assert_eq!(state.as_state_flow().version(), 0);
        assert!(state.update(|n| n + 1));
        assert_eq!(state.value(), 2);
        assert_eq!(state.as_state_flow().version(), 1);
    }

    #[test]
    fn slow_subscriber_skips_to_newest() {
        let state = MutableStateFlow::new(0);
        let mut sub = state.subscribe();
        assert_eq!(block_on(sub.next()), Some(0));

        state.set(1);
        state.set(2);
        state.set(3);
        assert_eq!(block_on(sub.next()), Some(3));
    }

    #[test]
    fn subscribers_are_woken_on_change() {
        let mut pool = LocalPool::new();
        let state = MutableStateFlow::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_in = seen.clone();
        let mut sub = state.subscribe();
        pool.spawner()
            .spawn_local(async move {
                while let Some(v) = sub.next().await {
                    seen_in.borrow_mut().push(v);
                }
            })
            .unwrap();

        pool.run_until_stalled();
        state.set(5);
        pool.run_until_stalled();
        state.set(5);
        state.set(6);
        pool.run_until_stalled();

        assert_eq!(*seen.borrow(), vec![0, 5, 6]);
    }

    #[test]
    fn dropped_subscriptions_release_their_waker() {
        let state = MutableStateFlow::new(0);
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        for _ in 0..1000 {
            let mut sub = state.subscribe();
            assert_eq!(sub.poll_next_unpin(&mut cx), Poll::Ready(Some(0)));
            assert_eq!(sub.poll_next_unpin(&mut cx), Poll::Pending);
            assert_eq!(sub.poll_next_unpin(&mut cx), Poll::Pending);
            assert_eq!(state.inner.waiters.borrow().len(), 1);
        }

        assert!(state.inner.waiters.borrow().is_empty());
        assert_eq!(state.subscription_count(), 0);
    }

    #[test]
    fn custom_policy_gates_updates() {
        let state = MutableStateFlow::with_policy(1.0_f64, Policy::custom(|a: &f64, b: &f64| (a - b).abs() < 0.5));
        assert!(!state.set(1.2));
        assert!(state.set(2.0));
    }

    #[test]
    fn as_flow_starts_with_current_value() {
        let state = MutableStateFlow::new(10).named("temperature");
        let first = block_on(state.as_flow().first()).unwrap();
        assert_eq!(first, Some(10));
        assert_eq!(state.as_flow().label(), "temperature");
    }
}
