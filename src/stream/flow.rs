// ============================================================================
// spark-recompose - Cold Flows
// Restartable stream recipes: every collection runs the producer anew
// ============================================================================
//
// A `Flow<T>` is a shared factory of boxed local streams. Collecting it opens
// a fresh stream, so two collectors never share producer state. Items are
// `Result<T, StreamError>`; an `Err` is the terminal event and nothing
// follows it.
// ============================================================================

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::{self, LocalBoxFuture};
use futures::stream::{self, LocalBoxStream, Stream, StreamExt};
use pin_project::pin_project;

use crate::core::context::Runtime;
use crate::core::error::{RuntimeError, StreamError};
use crate::core::types::{BoxError, TaskId};
use crate::primitives::task::{spawn_task, CancelToken, TaskHandle};

/// Stream produced by one collection of a flow.
pub type FlowStream<T> = LocalBoxStream<'static, Result<T, StreamError>>;

type Factory<T> = Rc<dyn Fn(&Rc<str>) -> FlowStream<T>>;

// =============================================================================
// FLOW
// =============================================================================

/// Cold stream: a recipe re-executed for every collector.
///
/// # Example
///
/// ```
/// use futures::executor::block_on;
/// use spark_recompose::stream::flow_of;
///
/// let numbers = flow_of(vec![1, 2, 3, 4]).map(|n| n * 10).filter(|n| *n > 10);
///
/// // Each collection replays the whole recipe
/// assert_eq!(block_on(numbers.to_vec()).unwrap(), vec![20, 30, 40]);
/// assert_eq!(block_on(numbers.to_vec()).unwrap(), vec![20, 30, 40]);
/// ```
pub struct Flow<T> {
    label: Rc<str>,
    factory: Factory<T>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            factory: self.factory.clone(),
        }
    }
}

/// Flows compare by identity: clones of one flow are equal, two flows built
/// from the same recipe are not. This is what lets a flow key an effect.
impl<T> PartialEq for Flow<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.factory, &other.factory)
    }
}

impl<T> fmt::Debug for Flow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Flow").field(&&*self.label).finish()
    }
}

impl<T: 'static> Flow<T> {
    /// Build a flow from a stream factory.
    pub fn from_factory(label: impl Into<Rc<str>>, factory: impl Fn() -> FlowStream<T> + 'static) -> Self {
        Self::labeled(label, move |_| factory())
    }

    /// Build a flow whose factory sees the flow's current label.
    pub(crate) fn labeled(
        label: impl Into<Rc<str>>,
        factory: impl Fn(&Rc<str>) -> FlowStream<T> + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            factory: Rc::new(factory),
        }
    }

    /// Label used in stream errors and logs
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn label_rc(&self) -> Rc<str> {
        self.label.clone()
    }

    /// Same recipe under a new label.
    pub fn named(&self, label: impl Into<Rc<str>>) -> Self {
        Self {
            label: label.into(),
            factory: self.factory.clone(),
        }
    }

    /// Start one independent execution of the recipe.
    ///
    /// The returned stream ends right after the first `Err`.
    pub fn stream(&self) -> FlowStream<T> {
        (self.factory)(&self.label)
            .scan(false, |failed, item| {
                if *failed {
                    return future::ready(None);
                }
                *failed = item.is_err();
                future::ready(Some(item))
            })
            .boxed_local()
    }

    // =========================================================================
    // TERMINAL OPERATIONS
    // =========================================================================

    /// Collect every item into `f`. Resolves with the terminal failure, if any.
    pub async fn collect(&self, mut f: impl FnMut(T)) -> Result<(), StreamError> {
        let mut items = self.stream();
        while let Some(item) = items.next().await {
            f(item?);
        }
        Ok(())
    }

    /// Collect every item into a vector.
    pub async fn to_vec(&self) -> Result<Vec<T>, StreamError> {
        let mut out = Vec::new();
        self.collect(|item| out.push(item)).await?;
        Ok(out)
    }

    /// First item, if the flow produces one.
    pub async fn first(&self) -> Result<Option<T>, StreamError> {
        let mut items = self.stream();
        items.next().await.transpose()
    }

    /// Collect on the runtime's executor. A terminal failure is logged and
    /// kept in the runtime diagnostics; cancel the handle to stop collecting.
    pub fn subscribe(&self, rt: &Runtime, mut f: impl FnMut(T) + 'static) -> TaskHandle {
        let flow = self.clone();
        let id = rt.inner.allocate_task_id();
        let task: LocalBoxFuture<'static, Result<(), BoxError>> = Box::pin(async move {
            flow.collect(&mut f).await?;
            Ok(())
        });
        spawn_task(
            &*rt.spawner(),
            id,
            CancelToken::new(),
            task,
            Some(stream_failure_hook(rt)),
        )
    }
}

/// Failure hook for tasks that collect a stream on behalf of a runtime.
pub(crate) fn stream_failure_hook(rt: &Runtime) -> Box<dyn FnOnce(TaskId, BoxError)> {
    let weak = rt.downgrade();
    Box::new(move |task, source| {
        let error = match source.downcast::<StreamError>() {
            Ok(stream_error) => RuntimeError::StreamTerminated(*stream_error),
            Err(other) => RuntimeError::StreamTerminated(StreamError::failed("subscription", other)),
        };
        tracing::warn!(%task, error = %error, "stream subscription terminated");
        if let Some(rt) = weak.upgrade() {
            rt.inner.record(error);
        }
    })
}

// =============================================================================
// BUILDERS
// =============================================================================

/// Handle a `flow` producer uses to hand values to its collector.
///
/// `emit` suspends until the collector has taken the value, so the producer
/// never runs ahead of the collector.
pub struct Emitter<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Emitter<T> {
    pub fn emit(&self, value: T) -> impl Future<Output = ()> + '_ {
        let mut value = Some(value);
        future::poll_fn(move |_| {
            let Some(v) = value.take() else {
                // Only re-polled once the collector emptied the slot
                return Poll::Ready(());
            };
            let mut slot = self.slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(v);
            } else {
                value = Some(v);
            }
            Poll::Pending
        })
    }
}

/// Stream side of a `flow` producer.
#[pin_project]
struct Produced<T> {
    #[pin]
    producer: Option<LocalBoxFuture<'static, Result<(), BoxError>>>,
    slot: Rc<RefCell<Option<T>>>,
    label: Rc<str>,
}

impl<T> Stream for Produced<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if let Some(value) = this.slot.borrow_mut().take() {
            return Poll::Ready(Some(Ok(value)));
        }
        let Some(producer) = this.producer.as_mut().as_pin_mut() else {
            return Poll::Ready(None);
        };
        match producer.poll(cx) {
            Poll::Ready(result) => {
                this.producer.set(None);
                if let Some(value) = this.slot.borrow_mut().take() {
                    // Unreachable for a well-behaved producer; keep the value
                    return Poll::Ready(Some(Ok(value)));
                }
                match result {
                    Ok(()) => Poll::Ready(None),
                    Err(err) => Poll::Ready(Some(Err(StreamError::failed(&**this.label, err)))),
                }
            }
            Poll::Pending => match this.slot.borrow_mut().take() {
                Some(value) => Poll::Ready(Some(Ok(value))),
                None => Poll::Pending,
            },
        }
    }
}

/// Cold flow from an async producer.
///
/// # Example
///
/// ```
/// use futures::executor::block_on;
/// use spark_recompose::stream::flow;
///
/// let countdown = flow(|out| async move {
///     for n in (1..=3).rev() {
///         out.emit(n).await;
///     }
///     Ok(())
/// });
///
/// assert_eq!(block_on(countdown.to_vec()).unwrap(), vec![3, 2, 1]);
/// ```
pub fn flow<T, F, Fut>(producer: F) -> Flow<T>
where
    T: 'static,
    F: Fn(Emitter<T>) -> Fut + 'static,
    Fut: Future<Output = Result<(), BoxError>> + 'static,
{
    Flow::labeled("flow", move |label| {
        let slot = Rc::new(RefCell::new(None));
        let emitter = Emitter { slot: slot.clone() };
        Produced {
            producer: Some(Box::pin(producer(emitter))),
            slot,
            label: label.clone(),
        }
        .boxed_local()
    })
}

/// Cold flow over the items of a collection.
pub fn flow_of<T, I>(items: I) -> Flow<T>
where
    T: 'static,
    I: IntoIterator<Item = T> + Clone + 'static,
    I::IntoIter: 'static,
{
    Flow::from_factory("flow_of", move || {
        stream::iter(items.clone().into_iter().map(Ok)).boxed_local()
    })
}

/// Flow that completes without emitting.
pub fn empty<T: 'static>() -> Flow<T> {
    Flow::from_factory("empty", || stream::empty().boxed_local())
}

/// Flow that fails immediately.
pub fn failing<T: 'static>(message: impl fmt::Display) -> Flow<T> {
    let message = message.to_string();
    Flow::labeled("failing", move |label| {
        stream::once(future::ready(Err(StreamError::Failed {
            stream: label.to_string(),
            message: message.clone(),
        })))
        .boxed_local()
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::cell::Cell;

    #[test]
    fn each_collection_runs_the_producer() {
        let runs = Rc::new(Cell::new(0));
        let runs_in = runs.clone();
        let numbers = flow(move |out| {
            let runs = runs_in.clone();
            async move {
                runs.set(runs.get() + 1);
                out.emit(1).await;
                out.emit(2).await;
                Ok(())
            }
        });

        assert_eq!(block_on(numbers.to_vec()).unwrap(), vec![1, 2]);
        assert_eq!(block_on(numbers.to_vec()).unwrap(), vec![1, 2]);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn producer_error_is_terminal() {
        let broken = flow(|out| async move {
            out.emit(1).await;
            Err("disk on fire".into())
        })
        .named("reader");

        let mut seen = Vec::new();
        let result = block_on(broken.collect(|v| seen.push(v)));

        assert_eq!(seen, vec![1]);
        assert_eq!(
            result,
            Err(StreamError::Failed {
                stream: "reader".to_string(),
                message: "disk on fire".to_string(),
            })
        );
    }

    #[test]
    fn nothing_follows_an_error() {
        let items = Flow::from_factory("mixed", || {
            stream::iter(vec![
                Ok(1),
                Err(StreamError::failed("mixed", "bad")),
                Ok(2),
            ])
            .boxed_local()
        });

        let all: Vec<_> = block_on(items.stream().collect::<Vec<_>>());
        assert_eq!(all.len(), 2);
        assert!(all[1].is_err());
    }

    #[test]
    fn producer_waits_for_collector() {
        let emitted = Rc::new(Cell::new(0));
        let emitted_in = emitted.clone();
        let numbers = flow(move |out| {
            let emitted = emitted_in.clone();
            async move {
                for n in 0..10 {
                    emitted.set(emitted.get() + 1);
                    out.emit(n).await;
                }
                Ok(())
            }
        });

        let mut items = numbers.stream();
        assert_eq!(block_on(items.next()), Some(Ok(0)));
        assert_eq!(emitted.get(), 1);
        assert_eq!(block_on(items.next()), Some(Ok(1)));
        assert_eq!(emitted.get(), 2);
    }

    #[test]
    fn builders() {
        assert_eq!(block_on(flow_of(vec!["a", "b"]).to_vec()).unwrap(), vec!["a", "b"]);
        assert!(block_on(empty::<i32>().to_vec()).unwrap().is_empty());
        assert!(block_on(failing::<i32>("nope").to_vec()).is_err());
        assert_eq!(block_on(flow_of(vec![5, 6]).first()).unwrap(), Some(5));
    }

    #[test]
    fn flows_compare_by_identity() {
        let a = flow_of(vec![1]);
        let b = flow_of(vec![1]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.named("renamed"), a);
    }
}
