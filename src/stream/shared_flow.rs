// ============================================================================
// spark-recompose - Shared Flows
// Hot broadcast with replay and backpressure
// ============================================================================
//
// Values are numbered in emission order. The buffer holds the values some
// subscriber has not taken yet plus the replay window; each subscriber keeps
// the number of the next value it will take.
//
//   head                       tail
//    |  taken by all  | pending |
//    [ v7 ][ v8 ][ v9 ][ v10 ]
//                  ^ slowest subscriber
//
// When the slowest subscriber lags `capacity` values behind, the next emit
// applies the configured `BackpressurePolicy`.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future;
use futures::stream::{Stream, StreamExt};

use crate::core::constants::{DEFAULT_EXTRA_BUFFER, DEFAULT_REPLAY};
use crate::core::error::StreamError;
use crate::stream::buffer::BackpressurePolicy;
use crate::stream::flow::Flow;

// =============================================================================
// CONFIG
// =============================================================================

/// Replay and buffering behaviour of a shared flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedFlowConfig {
    /// Past values handed to a new subscriber
    pub replay: usize,
    /// Slots beyond the replay window for values slow subscribers have not
    /// taken yet
    pub extra_buffer: usize,
    /// What `emit` does when the slowest subscriber is `capacity` behind
    pub policy: BackpressurePolicy,
}

impl Default for SharedFlowConfig {
    fn default() -> Self {
        Self {
            replay: DEFAULT_REPLAY,
            extra_buffer: DEFAULT_EXTRA_BUFFER,
            policy: BackpressurePolicy::Block,
        }
    }
}

impl SharedFlowConfig {
    pub fn replay(replay: usize) -> Self {
        Self {
            replay,
            ..Self::default()
        }
    }

    pub fn extra_buffer(mut self, extra: usize) -> Self {
        self.extra_buffer = extra;
        self
    }

    pub fn policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How far the slowest subscriber may lag before backpressure applies.
    pub fn capacity(&self) -> usize {
        (self.replay + self.extra_buffer).max(1)
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Subscriber {
    position: u64,
    waker: Option<Waker>,
}

struct SharedState<T> {
    buffer: VecDeque<T>,
    /// Number of `buffer[0]`
    head: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber: u64,
    emitters: Vec<Waker>,
    retired: bool,
}

impl<T> SharedState<T> {
    fn tail(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    fn slowest(&self) -> Option<u64> {
        self.subscribers.values().map(|s| s.position).min()
    }

    /// Drop values every subscriber has taken and that fell out of the
    /// replay window.
    fn trim(&mut self, replay: usize) {
        let tail = self.tail();
        let replay_start = tail.saturating_sub(replay as u64);
        let keep_from = match self.slowest() {
            Some(slowest) => slowest.min(replay_start),
            None => replay_start,
        };
        while self.head < keep_from && self.buffer.pop_front().is_some() {
            self.head += 1;
        }
    }

    fn take_subscriber_wakers(&mut self) -> Vec<Waker> {
        self.subscribers
            .values_mut()
            .filter_map(|s| s.waker.take())
            .collect()
    }
}

struct SharedInner<T> {
    label: RefCell<Rc<str>>,
    config: SharedFlowConfig,
    state: RefCell<SharedState<T>>,
    emitted: Cell<u64>,
}

fn wake(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

// =============================================================================
// SHARED FLOW
// =============================================================================

/// Hot broadcast point. Clones share the same buffer and subscribers.
///
/// # Example
///
/// ```
/// use futures::executor::block_on;
/// use futures::StreamExt;
/// use spark_recompose::stream::{SharedFlow, SharedFlowConfig};
///
/// let events = SharedFlow::new(SharedFlowConfig::default());
///
/// // Nobody listening and no replay: the value is gone
/// events.try_emit("e1").unwrap();
///
/// let mut late = events.subscribe();
/// events.try_emit("e2").unwrap();
/// assert_eq!(block_on(late.next()), Some("e2"));
/// ```
pub struct SharedFlow<T> {
    inner: Rc<SharedInner<T>>,
}

impl<T> Clone for SharedFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Offer<T> {
    Accepted,
    Full(T),
}

impl<T: Clone + 'static> SharedFlow<T> {
    pub fn new(config: SharedFlowConfig) -> Self {
        Self {
            inner: Rc::new(SharedInner {
                label: RefCell::new(Rc::from("shared")),
                config,
                state: RefCell::new(SharedState {
                    buffer: VecDeque::new(),
                    head: 0,
                    subscribers: BTreeMap::new(),
                    next_subscriber: 0,
                    emitters: Vec::new(),
                    retired: false,
                }),
                emitted: Cell::new(0),
            }),
        }
    }

    /// Set the label used in errors and logs.
    pub fn named(self, label: impl Into<Rc<str>>) -> Self {
        *self.inner.label.borrow_mut() = label.into();
        self
    }

    pub fn label(&self) -> Rc<str> {
        self.inner.label.borrow().clone()
    }

    pub fn config(&self) -> SharedFlowConfig {
        self.inner.config
    }

    fn retired_error(&self) -> StreamError {
        StreamError::Retired {
            stream: self.label().to_string(),
        }
    }

    fn offer(&self, value: T) -> Result<Offer<T>, StreamError> {
        let config = self.inner.config;
        let capacity = config.capacity() as u64;
        let mut state = self.inner.state.borrow_mut();
        if state.retired {
            return Err(self.retired_error());
        }

        let tail = state.tail();
        let lagging = state.slowest().is_some_and(|slowest| tail - slowest >= capacity);
        if lagging && config.policy == BackpressurePolicy::Block {
            return Ok(Offer::Full(value));
        }

        state.buffer.push_back(value);
        let new_tail = tail + 1;
        if lagging {
            // Move lagging subscribers forward past the values they lose
            let floor = match config.policy {
                BackpressurePolicy::DropOldest => new_tail - capacity,
                _ => new_tail - 1,
            };
            for subscriber in state.subscribers.values_mut() {
                if tail - subscriber.position >= capacity {
                    subscriber.position = subscriber.position.max(floor);
                }
            }
            tracing::trace!(stream = %self.inner.label.borrow(), policy = ?config.policy, "slow subscriber lost values");
        }
        state.trim(config.replay);
        self.inner.emitted.set(self.inner.emitted.get() + 1);

        let wakers = state.take_subscriber_wakers();
        drop(state);
        wake(wakers);
        Ok(Offer::Accepted)
    }

    /// Emit without suspending. Returns `Ok(false)` when the value was
    /// refused because a `Block` buffer is full.
    pub fn try_emit(&self, value: T) -> Result<bool, StreamError> {
        match self.offer(value)? {
            Offer::Accepted => Ok(true),
            Offer::Full(_) => Ok(false),
        }
    }

    /// Emit, suspending while a `Block` buffer is full.
    ///
    /// Fails with `StreamError::Retired` once the flow was retired, also
    /// when retirement happens while waiting for room.
    pub async fn emit(&self, value: T) -> Result<(), StreamError> {
        let mut value = Some(value);
        future::poll_fn(|cx| {
            let Some(next) = value.take() else {
                return Poll::Ready(Ok(()));
            };
            match self.offer(next) {
                Err(err) => Poll::Ready(Err(err)),
                Ok(Offer::Accepted) => Poll::Ready(Ok(())),
                Ok(Offer::Full(back)) => {
                    value = Some(back);
                    self.inner.state.borrow_mut().emitters.push(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }

    /// Subscribe. The subscription starts with up to `replay` past values.
    pub fn subscribe(&self) -> SharedSubscription<T> {
        let replay = self.inner.config.replay as u64;
        let mut state = self.inner.state.borrow_mut();
        let position = state.tail().saturating_sub(replay).max(state.head);
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                position,
                waker: None,
            },
        );
        SharedSubscription {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Cold view: every collection subscribes anew.
    pub fn as_flow(&self) -> Flow<T> {
        let shared = self.clone();
        Flow::labeled(self.label(), move |_| shared.subscribe().map(Ok).boxed_local())
    }

    /// Values a new subscriber would receive first.
    pub fn replay_cache(&self) -> Vec<T> {
        let replay = self.inner.config.replay as u64;
        let state = self.inner.state.borrow();
        let start = state.tail().saturating_sub(replay).max(state.head);
        let skip = (start - state.head) as usize;
        state.buffer.iter().skip(skip).cloned().collect()
    }

    /// End every subscription once it has taken its buffered values.
    /// Later emits fail with `StreamError::Retired`.
    pub fn retire(&self) {
        let mut state = self.inner.state.borrow_mut();
        if state.retired {
            return;
        }
        state.retired = true;
        let mut wakers = state.take_subscriber_wakers();
        wakers.append(&mut state.emitters);
        drop(state);
        tracing::debug!(stream = %self.inner.label.borrow(), "shared flow retired");
        wake(wakers);
    }

    pub fn is_retired(&self) -> bool {
        self.inner.state.borrow().retired
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.borrow().subscribers.len()
    }

    /// Values accepted since creation
    pub fn emitted_count(&self) -> u64 {
        self.inner.emitted.get()
    }
}

impl<T> fmt::Debug for SharedFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("SharedFlow")
            .field("label", &&**self.inner.label.borrow())
            .field("config", &self.inner.config)
            .field("buffered", &state.buffer.len())
            .field("subscribers", &state.subscribers.len())
            .field("retired", &state.retired)
            .finish()
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Live subscription to a shared flow. Dropping it unsubscribes.
pub struct SharedSubscription<T> {
    inner: Rc<SharedInner<T>>,
    id: u64,
}

impl<T: Clone> Stream for SharedSubscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let replay = self.inner.config.replay;
        let mut state = self.inner.state.borrow_mut();
        let tail = state.tail();
        let head = state.head;
        let Some(position) = state.subscribers.get(&self.id).map(|s| s.position) else {
            return Poll::Ready(None);
        };

        if position < tail {
            let value = state.buffer[(position - head) as usize].clone();
            if let Some(subscriber) = state.subscribers.get_mut(&self.id) {
                subscriber.position = position + 1;
            }
            state.trim(replay);
            let emitters = std::mem::take(&mut state.emitters);
            drop(state);
            wake(emitters);
            return Poll::Ready(Some(value));
        }

        if state.retired {
            return Poll::Ready(None);
        }
        if let Some(subscriber) = state.subscribers.get_mut(&self.id) {
            subscriber.waker = Some(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> Drop for SharedSubscription<T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.borrow_mut();
        state.subscribers.remove(&self.id);
        state.trim(self.inner.config.replay);
        let emitters = std::mem::take(&mut state.emitters);
        drop(state);
        wake(emitters);
    }
}

// =============================================================================
// TESTS
// =============================================================================
