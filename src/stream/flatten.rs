// ============================================================================
// spark-recompose - Flattening
// concat, merge and switch_latest over flows of flows
// ============================================================================

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future;
use futures::stream::{self, SelectAll, Stream, StreamExt};

use crate::core::error::StreamError;
use crate::stream::flow::{flow_of, Flow, FlowStream};

impl<T: 'static> Flow<Flow<T>> {
    /// Drain each inner flow completely before starting the next.
    pub fn concat(&self) -> Flow<T> {
        let outer = self.clone();
        Flow::labeled(self.label_rc(), move |_| {
            outer
                .stream()
                .flat_map(|item| match item {
                    Ok(inner) => inner.stream(),
                    Err(err) => stream::once(future::ready(Err(err))).boxed_local(),
                })
                .boxed_local()
        })
    }

    /// Run every inner flow concurrently; values arrive in the order they
    /// are produced. Ends when the outer flow and all inner flows have ended.
    pub fn merge(&self) -> Flow<T> {
        let outer = self.clone();
        Flow::labeled(self.label_rc(), move |_| {
            Merge {
                outer: Some(outer.stream()),
                inners: SelectAll::new(),
            }
            .boxed_local()
        })
    }

    /// Follow only the most recent inner flow. A new inner flow drops the
    /// previous one, cancelling its producer.
    pub fn switch_latest(&self) -> Flow<T> {
        let outer = self.clone();
        Flow::labeled(self.label_rc(), move |label| {
            Switch {
                outer: Some(outer.stream()),
                inner: None,
                label: label.to_string(),
            }
            .boxed_local()
        })
    }
}

/// Merge several flows into one.
///
/// ```
/// use futures::executor::block_on;
/// use spark_recompose::stream::{flow_of, merge};
///
/// let mut all = block_on(merge(vec![flow_of(vec![1, 2]), flow_of(vec![3])]).to_vec()).unwrap();
/// all.sort();
/// assert_eq!(all, vec![1, 2, 3]);
/// ```
pub fn merge<T: 'static>(flows: impl IntoIterator<Item = Flow<T>>) -> Flow<T> {
    let flows: Vec<Flow<T>> = flows.into_iter().collect();
    flow_of(flows).merge().named("merge")
}

// =============================================================================
// MERGE
// =============================================================================

struct Merge<T> {
    outer: Option<FlowStream<Flow<T>>>,
    inners: SelectAll<FlowStream<T>>,
}

impl<T: 'static> Stream for Merge<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(outer) = this.outer.as_mut() {
            let mut outer_done = false;
            loop {
                match outer.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(inner))) => this.inners.push(inner.stream()),
                    Poll::Ready(Some(Err(err))) => {
                        this.outer = None;
                        this.inners = SelectAll::new();
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        outer_done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
            if outer_done {
                this.outer = None;
            }
        }

        match this.inners.poll_next_unpin(cx) {
            Poll::Ready(Some(Err(err))) => {
                // One failing inner ends the merged flow
                this.outer = None;
                this.inners = SelectAll::new();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) if this.outer.is_none() => Poll::Ready(None),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// SWITCH LATEST
// =============================================================================

struct Switch<T> {
    outer: Option<FlowStream<Flow<T>>>,
    inner: Option<FlowStream<T>>,
    label: String,
}

impl<T: 'static> Stream for Switch<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(outer) = this.outer.as_mut() {
            let mut outer_done = false;
            loop {
                match outer.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(next))) => {
                        if this.inner.is_some() {
                            tracing::trace!(stream = %this.label, "switching to newer inner flow");
                        }
                        // Replacing drops (and cancels) the previous inner stream
                        this.inner = Some(next.stream());
                    }
                    Poll::Ready(Some(Err(err))) => {
                        this.outer = None;
                        this.inner = None;
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        outer_done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
            if outer_done {
                this.outer = None;
            }
        }

        let polled = match this.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        };
        match polled {
            Poll::Ready(Some(item)) => Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                this.inner = None;
                if this.outer.is_none() {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::flow::{failing, flow};
    use futures::executor::block_on;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn concat_drains_in_order() {
        let flows = flow_of(vec![flow_of(vec![1, 2]), flow_of(vec![]), flow_of(vec![3])]);
        assert_eq!(block_on(flows.concat().to_vec()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn concat_stops_at_a_failing_inner() {
        let flows = flow_of(vec![flow_of(vec![1]), failing("inner"), flow_of(vec![2])]);
        let mut seen = Vec::new();
        let result = block_on(flows.concat().collect(|n| seen.push(n)));
        assert_eq!(seen, vec![1]);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn merge_interleaves_by_arrival() {
        let a = flow(|out| async move {
            out.emit(1).await;
            sleep_ms(20).await;
            out.emit(3).await;
            Ok(())
        });
        let b = flow(|out| async move {
            sleep_ms(10).await;
            out.emit(2).await;
            sleep_ms(20).await;
            out.emit(4).await;
            Ok(())
        });

        assert_eq!(merge(vec![a, b]).to_vec().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        assert!(block_on(merge(Vec::<Flow<i32>>::new()).to_vec()).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn switch_latest_cancels_the_previous_inner() {
        let ticked = Rc::new(Cell::new(0));
        let ticked_in = ticked.clone();
        let ticker = flow(move |out| {
            let ticked = ticked_in.clone();
            async move {
                for n in 0..10 {
                    ticked.set(ticked.get() + 1);
                    out.emit(format!("a{n}")).await;
                    sleep_ms(10).await;
                }
                Ok(())
            }
        });
        let burst = flow_of(vec!["b0".to_string(), "b1".to_string()]);

        let outer = flow(move |out| {
            let (ticker, burst) = (ticker.clone(), burst.clone());
            async move {
                out.emit(ticker).await;
                sleep_ms(25).await;
                out.emit(burst).await;
                Ok(())
            }
        });

        let seen = outer.switch_latest().to_vec().await.unwrap();
        assert_eq!(seen, vec!["a0", "a1", "a2", "b0", "b1"]);
        assert_eq!(ticked.get(), 3);
    }
}
