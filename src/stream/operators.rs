// ============================================================================
// spark-recompose - Flow Operators
// Per-item transforms on cold flows
// ============================================================================
//
// Every operator returns a new cold flow. Collecting it opens a fresh stream
// of the upstream flow, so operator state (a debounce timer, a take counter)
// is per collection and never shared between collectors.
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future;
use futures::stream::{self, Stream, StreamExt};
use pin_project::pin_project;
use tokio::time::Sleep;

use crate::core::error::StreamError;
use crate::stream::flow::{Flow, FlowStream};

impl<T: 'static> Flow<T> {
    /// Transform every value.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Flow<U> {
        let upstream = self.clone();
        let f = Rc::new(f);
        Flow::labeled(self.label_rc(), move |_| {
            let f = f.clone();
            upstream
                .stream()
                .map(move |item| item.map(|value| f(value)))
                .boxed_local()
        })
    }

    /// Keep the values matching `predicate`. Failures always pass.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + 'static) -> Flow<T> {
        let upstream = self.clone();
        let predicate = Rc::new(predicate);
        Flow::labeled(self.label_rc(), move |_| {
            let predicate = predicate.clone();
            upstream
                .stream()
                .filter(move |item| {
                    future::ready(match item {
                        Ok(value) => predicate(value),
                        Err(_) => true,
                    })
                })
                .boxed_local()
        })
    }

    /// Run `f` on every value as it passes through.
    pub fn on_each(&self, f: impl Fn(&T) + 'static) -> Flow<T> {
        let upstream = self.clone();
        let f = Rc::new(f);
        Flow::labeled(self.label_rc(), move |_| {
            let f = f.clone();
            upstream
                .stream()
                .inspect(move |item| {
                    if let Ok(value) = item {
                        f(value);
                    }
                })
                .boxed_local()
        })
    }

    /// First `n` values, then end.
    ///
    /// The upstream stream is dropped as soon as the n-th value arrives, which
    /// cancels its producer at its current suspension point.
    ///
    /// ```
    /// use futures::executor::block_on;
    /// use spark_recompose::stream::flow;
    ///
    /// // Infinite producer, stopped by take
    /// let naturals = flow(|out| async move {
    ///     let mut n = 0;
    ///     loop {
    ///         out.emit(n).await;
    ///         n += 1;
    ///     }
    /// });
    ///
    /// assert_eq!(block_on(naturals.take(3).to_vec()).unwrap(), vec![0, 1, 2]);
    /// ```
    pub fn take(&self, n: usize) -> Flow<T> {
        let upstream = self.clone();
        Flow::labeled(self.label_rc(), move |_| {
            if n == 0 {
                return stream::empty().boxed_local();
            }
            stream::unfold((Some(upstream.stream()), n), |(upstream, left)| async move {
                let mut upstream = upstream?;
                let item = upstream.next().await?;
                let left = left - 1;
                let upstream = if left == 0 || item.is_err() {
                    drop(upstream);
                    None
                } else {
                    Some(upstream)
                };
                Some((item, (upstream, left)))
            })
            .boxed_local()
        })
    }

    /// Skip values equal to the previously emitted one.
    pub fn distinct_until_changed(&self) -> Flow<T>
    where
        T: PartialEq + Clone,
    {
        let upstream = self.clone();
        Flow::labeled(self.label_rc(), move |_| {
            upstream
                .stream()
                .scan(None::<T>, |last, item| {
                    let out = match item {
                        Ok(value) if last.as_ref() == Some(&value) => None,
                        Ok(value) => {
                            *last = Some(value.clone());
                            Some(Ok(value))
                        }
                        Err(err) => Some(Err(err)),
                    };
                    future::ready(Some(out))
                })
                .filter_map(future::ready)
                .boxed_local()
        })
    }

    /// Recover from a terminal failure by switching to the flow `handler`
    /// returns. Failures of the fallback are not caught again.
    ///
    /// ```
    /// use futures::executor::block_on;
    /// use spark_recompose::stream::{failing, flow_of};
    ///
    /// let recovered = failing::<i32>("offline").catch(|err| {
    ///     assert_eq!(err.stream(), "failing");
    ///     flow_of(vec![-1])
    /// });
    /// assert_eq!(block_on(recovered.to_vec()).unwrap(), vec![-1]);
    /// ```
    pub fn catch(&self, handler: impl Fn(StreamError) -> Flow<T> + 'static) -> Flow<T> {
        let upstream = self.clone();
        let handler = Rc::new(handler);
        Flow::labeled(self.label_rc(), move |_| {
            let handler = handler.clone();
            upstream
                .stream()
                .flat_map(move |item| match item {
                    Ok(value) => stream::once(future::ready(Ok(value))).boxed_local(),
                    Err(err) => {
                        tracing::debug!(stream = err.stream(), error = %err, "stream failure caught");
                        handler(err).stream()
                    }
                })
                .boxed_local()
        })
    }

    /// Fail with `StreamError::Timeout` when the next item takes longer than
    /// `after` to arrive. The upstream stream is dropped on timeout.
    ///
    /// Needs a tokio runtime with the time driver.
    pub fn timeout(&self, after: Duration) -> Flow<T> {
        let upstream = self.clone();
        Flow::labeled(self.label_rc(), move |label| {
            let label = label.clone();
            stream::unfold(Some(upstream.stream()), move |upstream| {
                let label = label.clone();
                async move {
                    let mut upstream = upstream?;
                    match tokio::time::timeout(after, upstream.next()).await {
                        Ok(Some(item)) => Some((item, Some(upstream))),
                        Ok(None) => None,
                        Err(_) => {
                            let err = StreamError::Timeout {
                                stream: label.to_string(),
                                after,
                            };
                            Some((Err(err), None))
                        }
                    }
                }
            })
            .boxed_local()
        })
    }

    /// Emit a value only once `quiet` has elapsed without a newer one.
    ///
    /// The pending value is flushed when the upstream ends; a failure is
    /// forwarded at once and discards the pending value. Needs a tokio
    /// runtime with the time driver.
    pub fn debounce(&self, quiet: Duration) -> Flow<T> {
        let upstream = self.clone();
        Flow::labeled(self.label_rc(), move |_| {
            Debounce {
                upstream: upstream.stream(),
                timer: None,
                pending: None,
                quiet,
                upstream_done: false,
            }
            .boxed_local()
        })
    }
}

// =============================================================================
// DEBOUNCE
// =============================================================================

#[pin_project]
struct Debounce<T> {
    upstream: FlowStream<T>,
    #[pin]
    timer: Option<Sleep>,
    pending: Option<T>,
    quiet: Duration,
    upstream_done: bool,
}

impl<T> Stream for Debounce<T> {
    type Item = Result<T, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain everything the upstream has ready; only the newest survives
        while !*this.upstream_done {
            match this.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(value))) => {
                    *this.pending = Some(value);
                    this.timer.set(Some(tokio::time::sleep(*this.quiet)));
                }
                Poll::Ready(Some(Err(err))) => {
                    *this.upstream_done = true;
                    *this.pending = None;
                    this.timer.set(None);
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    *this.upstream_done = true;
                    this.timer.set(None);
                }
                Poll::Pending => break,
            }
        }

        if *this.upstream_done {
            return Poll::Ready(this.pending.take().map(Ok));
        }

        let fired = match this.timer.as_mut().as_pin_mut() {
            Some(timer) => timer.poll(cx).is_ready(),
            None => false,
        };
        if fired {
            this.timer.set(None);
            if let Some(value) = this.pending.take() {
                return Poll::Ready(Some(Ok(value)));
            }
        }
        Poll::Pending
    }
}

// =============================================================================
// TESTS
// =============================================================================
