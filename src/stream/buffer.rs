// ============================================================================
// spark-recompose - Buffering
// Decouple a fast producer from a slow collector
// ============================================================================
//
// `buffer` runs the upstream stream in its own pump task and hands values to
// the collector through a bounded queue. What happens when the queue is full
// is the producer's choice of `BackpressurePolicy`.
// ============================================================================

use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future;
use futures::stream::{Stream, StreamExt};

use crate::core::error::StreamError;
use crate::core::types::{BoxError, TaskId};
use crate::primitives::task::{spawn_task, CancelToken, Spawner, TaskHandle, TokioSpawner};
use crate::stream::flow::{Flow, FlowStream};

/// What a full buffer does with a new value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BackpressurePolicy {
    /// Suspend the producer until there is room
    #[default]
    Block,
    /// Evict the oldest buffered value to admit the new one
    DropOldest,
    /// Collapse the buffer to the new value
    Conflate,
}

/// Apply `policy` to a full-or-not queue. Returns the value back when the
/// producer has to wait for room.
pub(crate) fn admit<T>(
    queue: &mut VecDeque<T>,
    capacity: usize,
    policy: BackpressurePolicy,
    value: T,
) -> Option<T> {
    if queue.len() < capacity {
        queue.push_back(value);
        return None;
    }
    match policy {
        BackpressurePolicy::Block => Some(value),
        BackpressurePolicy::DropOldest => {
            queue.pop_front();
            queue.push_back(value);
            None
        }
        BackpressurePolicy::Conflate => {
            queue.clear();
            queue.push_back(value);
            None
        }
    }
}

// =============================================================================
// PUMP QUEUE
// =============================================================================

struct PumpQueue<T> {
    items: VecDeque<T>,
    failure: Option<StreamError>,
    capacity: usize,
    policy: BackpressurePolicy,
    done: bool,
    collector: Option<Waker>,
    producer: Option<Waker>,
}

impl<T> PumpQueue<T> {
    fn wake_collector(&mut self) {
        if let Some(waker) = self.collector.take() {
            waker.wake();
        }
    }
}

/// Collector side: drains the queue. Dropping it cancels the pump.
struct Buffered<T> {
    queue: Rc<RefCell<PumpQueue<T>>>,
    pump: TaskHandle,
}

impl<T> Stream for Buffered<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut queue = self.queue.borrow_mut();
        if let Some(value) = queue.items.pop_front() {
            if let Some(waker) = queue.producer.take() {
                waker.wake();
            }
            return Poll::Ready(Some(Ok(value)));
        }
        if let Some(err) = queue.failure.take() {
            return Poll::Ready(Some(Err(err)));
        }
        if queue.done {
            return Poll::Ready(None);
        }
        queue.collector = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for Buffered<T> {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}

impl<T: 'static> Flow<T> {
    /// Buffer up to `capacity` values ahead of the collector.
    ///
    /// The upstream is collected in a pump task spawned with `TokioSpawner`,
    /// so collection must happen inside a tokio `LocalSet`.
    pub fn buffer(&self, capacity: usize, policy: BackpressurePolicy) -> Flow<T> {
        self.buffer_on(Rc::new(TokioSpawner), capacity, policy)
    }

    /// `buffer` with the pump task spawned on `spawner`.
    pub fn buffer_on(
        &self,
        spawner: Rc<dyn Spawner>,
        capacity: usize,
        policy: BackpressurePolicy,
    ) -> Flow<T> {
        let upstream = self.clone();
        let capacity = capacity.max(1);
        Flow::labeled(self.label_rc(), move |label| {
            let queue = Rc::new(RefCell::new(PumpQueue {
                items: VecDeque::with_capacity(capacity),
                failure: None,
                capacity,
                policy,
                done: false,
                collector: None,
                producer: None,
            }));
            let task = pump(upstream.stream(), queue.clone());
            let id = TaskId::next();
            tracing::trace!(task = %id, stream = &**label, capacity, ?policy, "buffer pump started");
            let pump = spawn_task(&*spawner, id, CancelToken::new(), Box::pin(task), None);
            Buffered { queue, pump }.boxed_local()
        })
    }

    /// Keep only the newest value while the collector is busy.
    ///
    /// A slow collector sees a subsequence of the upstream values that always
    /// ends with the upstream's last value.
    pub fn conflate(&self) -> Flow<T> {
        self.buffer(1, BackpressurePolicy::Conflate)
    }
}

async fn pump<T: 'static>(
    mut upstream: FlowStream<T>,
    queue: Rc<RefCell<PumpQueue<T>>>,
) -> Result<(), BoxError> {
    while let Some(item) = upstream.next().await {
        let value = match item {
            Ok(value) => value,
            Err(err) => {
                let mut queue = queue.borrow_mut();
                queue.failure = Some(err);
                queue.done = true;
                queue.wake_collector();
                return Ok(());
            }
        };

        let mut value = Some(value);
        future::poll_fn(|cx| {
            let mut queue = queue.borrow_mut();
            let Some(next) = value.take() else {
                return Poll::Ready(());
            };
            let (capacity, policy) = (queue.capacity, queue.policy);
            match admit(&mut queue.items, capacity, policy, next) {
                None => {
                    queue.wake_collector();
                    Poll::Ready(())
                }
                Some(back) => {
                    value = Some(back);
                    queue.producer = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await;
    }

    let mut queue = queue.borrow_mut();
    queue.done = true;
    queue.wake_collector();
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::flow::{flow, flow_of};
    use futures::executor::LocalPool;
    use std::cell::Cell;

    #[test]
    fn admit_policies() {
        let mut queue: VecDeque<i32> = VecDeque::from(vec![1, 2]);
        assert_eq!(admit(&mut queue, 2, BackpressurePolicy::Block, 3), Some(3));
        assert_eq!(queue, VecDeque::from(vec![1, 2]));

        assert_eq!(admit(&mut queue, 2, BackpressurePolicy::DropOldest, 3), None);
        assert_eq!(queue, VecDeque::from(vec![2, 3]));

        assert_eq!(admit(&mut queue, 2, BackpressurePolicy::Conflate, 4), None);
        assert_eq!(queue, VecDeque::from(vec![4]));

        assert_eq!(admit(&mut queue, 2, BackpressurePolicy::Block, 5), None);
        assert_eq!(queue, VecDeque::from(vec![4, 5]));
    }

    fn pooled(pool: &LocalPool) -> Rc<dyn Spawner> {
        Rc::new(pool.spawner())
    }

    #[test]
    fn block_delivers_everything_in_order() {
        let mut pool = LocalPool::new();
        let spawner = pooled(&pool);
        let out = Rc::new(RefCell::new(None));
        let out_in = out.clone();

        let buffered = flow_of(1..=20).buffer_on(spawner.clone(), 3, BackpressurePolicy::Block);
        spawner.spawn(Box::pin(async move {
            *out_in.borrow_mut() = Some(buffered.to_vec().await);
        }));
        pool.run_until_stalled();

        let collected = out.borrow_mut().take().unwrap().unwrap();
        assert_eq!(collected, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn failure_arrives_after_buffered_values() {
        let mut pool = LocalPool::new();
        let spawner = pooled(&pool);
        let out = Rc::new(RefCell::new(Vec::new()));
        let out_in = out.clone();

        let source = flow(|out| async move {
            out.emit(1).await;
            Err("upstream gone".into())
        });
        let buffered = source.buffer_on(spawner.clone(), 4, BackpressurePolicy::Block);
        spawner.spawn(Box::pin(async move {
            let mut items = buffered.stream();
            while let Some(item) = items.next().await {
                out_in.borrow_mut().push(item.is_ok());
            }
        }));
        pool.run_until_stalled();

        assert_eq!(*out.borrow(), vec![true, false]);
    }

    #[test]
    fn dropping_the_collector_cancels_the_pump() {
        let mut pool = LocalPool::new();
        let spawner = pooled(&pool);
        let produced = Rc::new(Cell::new(0));
        let produced_in = produced.clone();

        let endless = flow(move |out| {
            let produced = produced_in.clone();
            async move {
                loop {
                    produced.set(produced.get() + 1);
                    out.emit(()).await;
                }
            }
        });

        let buffered = endless.buffer_on(spawner.clone(), 2, BackpressurePolicy::Block);
        let items = buffered.stream();
        pool.run_until_stalled();
        // Two buffered, a third waiting for room
        assert_eq!(produced.get(), 3);

        drop(items);
        pool.run_until_stalled();
        assert_eq!(produced.get(), 3);
    }
}
