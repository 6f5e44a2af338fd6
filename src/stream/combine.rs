// ============================================================================
// spark-recompose - Combining Flows
// zip and combine
// ============================================================================

use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use pin_project::pin_project;

use crate::core::error::StreamError;
use crate::stream::flow::{Flow, FlowStream};

impl<A: 'static> Flow<A> {
    /// Pair values by position. Ends as soon as either side ends.
    ///
    /// ```
    /// use futures::executor::block_on;
    /// use spark_recompose::stream::flow_of;
    ///
    /// let pairs = flow_of(1..=3).zip(&flow_of(vec!["a", "b"]));
    /// assert_eq!(block_on(pairs.to_vec()).unwrap(), vec![(1, "a"), (2, "b")]);
    /// ```
    pub fn zip<B: 'static>(&self, other: &Flow<B>) -> Flow<(A, B)> {
        let (left, right) = (self.clone(), other.clone());
        Flow::labeled(self.label_rc(), move |_| {
            Zip {
                left: left.stream(),
                right: right.stream(),
                left_value: None,
                right_value: None,
                done: false,
            }
            .boxed_local()
        })
    }

    /// Emit `f(latest_left, latest_right)` whenever either side emits.
    ///
    /// Nothing is emitted until both sides have produced a value. The
    /// combined flow ends once both sides have ended; a failure on either
    /// side ends it at once.
    pub fn combine<B: 'static, C: 'static>(
        &self,
        other: &Flow<B>,
        f: impl Fn(&A, &B) -> C + 'static,
    ) -> Flow<C> {
        let (left, right) = (self.clone(), other.clone());
        let f: Rc<dyn Fn(&A, &B) -> C> = Rc::new(f);
        Flow::labeled(self.label_rc(), move |_| {
            Combine {
                left: left.stream(),
                right: right.stream(),
                latest_left: None,
                latest_right: None,
                left_done: false,
                right_done: false,
                right_first: false,
                f: f.clone(),
            }
            .boxed_local()
        })
    }
}

// =============================================================================
// ZIP
// =============================================================================

#[pin_project]
struct Zip<A, B> {
    left: FlowStream<A>,
    right: FlowStream<B>,
    left_value: Option<A>,
    right_value: Option<B>,
    done: bool,
}

impl<A, B> Stream for Zip<A, B> {
    type Item = Result<(A, B), StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if this.left_value.is_none() {
            match this.left.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(a))) => *this.left_value = Some(a),
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }
        }
        if this.right_value.is_none() {
            match this.right.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(b))) => *this.right_value = Some(b),
                Poll::Ready(Some(Err(err))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }
        }

        match (this.left_value.take(), this.right_value.take()) {
            (Some(a), Some(b)) => Poll::Ready(Some(Ok((a, b)))),
            (a, b) => {
                *this.left_value = a;
                *this.right_value = b;
                Poll::Pending
            }
        }
    }
}

// =============================================================================
// COMBINE
// =============================================================================

#[pin_project]
struct Combine<A, B, C> {
    left: FlowStream<A>,
    right: FlowStream<B>,
    latest_left: Option<A>,
    latest_right: Option<B>,
    left_done: bool,
    right_done: bool,
    // Alternates so a busy side cannot starve the other
    right_first: bool,
    f: Rc<dyn Fn(&A, &B) -> C>,
}

enum SidePoll {
    Value,
    Idle,
    Failed(StreamError),
}

fn poll_side<T>(
    stream: &mut FlowStream<T>,
    latest: &mut Option<T>,
    done: &mut bool,
    cx: &mut Context<'_>,
) -> SidePoll {
    if *done {
        return SidePoll::Idle;
    }
    match stream.poll_next_unpin(cx) {
        Poll::Ready(Some(Ok(value))) => {
            *latest = Some(value);
            SidePoll::Value
        }
        Poll::Ready(Some(Err(err))) => {
            *done = true;
            SidePoll::Failed(err)
        }
        Poll::Ready(None) => {
            *done = true;
            SidePoll::Idle
        }
        Poll::Pending => SidePoll::Idle,
    }
}

impl<A, B, C> Stream for Combine<A, B, C> {
    type Item = Result<C, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        loop {
            let mut progressed = false;
            for step in 0..2 {
                let poll_right = (step == 0) == *this.right_first;
                let outcome = if poll_right {
                    poll_side(this.right, this.latest_right, this.right_done, cx)
                } else {
                    poll_side(this.left, this.latest_left, this.left_done, cx)
                };
                match outcome {
                    SidePoll::Failed(err) => {
                        *this.left_done = true;
                        *this.right_done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                    SidePoll::Value => {
                        progressed = true;
                        if let (Some(a), Some(b)) = (this.latest_left.as_ref(), this.latest_right.as_ref()) {
                            *this.right_first = !*this.right_first;
                            return Poll::Ready(Some(Ok((this.f)(a, b))));
                        }
                    }
                    SidePoll::Idle => {}
                }
            }
            if *this.left_done && *this.right_done {
                return Poll::Ready(None);
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::stream::flow::{empty, failing, flow, flow_of};
    use futures::executor::block_on;
    use std::time::Duration;

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[test]
    fn zip_ends_with_the_shorter_side() {
        let zipped = flow_of(vec![1, 2, 3, 4]).zip(&flow_of(vec!['x', 'y']));
        assert_eq!(block_on(zipped.to_vec()).unwrap(), vec![(1, 'x'), (2, 'y')]);

        let none = flow_of(vec![1]).zip(&empty::<u8>());
        assert!(block_on(none.to_vec()).unwrap().is_empty());
    }

    #[test]
    fn zip_fails_with_either_side() {
        let zipped = flow_of(vec![1, 2]).zip(&failing::<i32>("boom").named("right"));
        assert_eq!(block_on(zipped.to_vec()).unwrap_err().stream(), "right");
    }

    #[tokio::test(start_paused = true)]
    async fn combine_uses_latest_of_the_other_side() {
        let left = flow(|out| async move {
            out.emit(1).await;
            sleep_ms(30).await;
            out.emit(2).await;
            Ok(())
        });
        let right = flow(|out| async move {
            sleep_ms(10).await;
            out.emit("a").await;
            sleep_ms(10).await;
            out.emit("b").await;
            Ok(())
        });

        let joined = left.combine(&right, |n, s| format!("{n}{s}"));
        assert_eq!(joined.to_vec().await.unwrap(), vec!["1a", "1b", "2b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn combine_waits_for_both_sides() {
        let left = flow_of(vec![1, 2, 3]);
        let right = flow(|out| async move {
            sleep_ms(10).await;
            out.emit('x').await;
            Ok(())
        });

        let joined = left.combine(&right, |n, c| (*n, *c));
        assert_eq!(joined.to_vec().await.unwrap(), vec![(3, 'x')]);
    }

    #[test]
    fn combine_with_a_silent_side_emits_nothing() {
        let joined = flow_of(vec![1, 2]).combine(&empty::<i32>(), |a, b| a + b);
        assert!(block_on(joined.to_vec()).unwrap().is_empty());
    }
}
