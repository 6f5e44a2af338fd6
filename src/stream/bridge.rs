// ============================================================================
// spark-recompose - Hot/Cold Bridges
// Turning flows into hot streams and into scope state
// ============================================================================

use futures::future::LocalBoxFuture;
use futures::StreamExt;

use crate::core::context::Runtime;
use crate::core::types::BoxError;
use crate::primitives::scope::Composer;
use crate::primitives::task::{spawn_task, CancelToken, TaskHandle};
use crate::stream::flow::{stream_failure_hook, Flow};
use crate::stream::shared_flow::{SharedFlow, SharedFlowConfig};
use crate::stream::state_flow::{MutableStateFlow, StateFlow};

impl<T: Clone + PartialEq + 'static> Flow<T> {
    /// Collect on the runtime's executor into a state flow that starts at
    /// `initial`. Cancel the handle to stop collecting; the state flow keeps
    /// its last value.
    pub fn state_in(&self, rt: &Runtime, initial: T) -> (StateFlow<T>, TaskHandle) {
        let state = MutableStateFlow::new(initial).named(self.label_rc());
        let writer = state.clone();
        let handle = self.subscribe(rt, move |value| {
            writer.set(value);
        });
        (state.as_state_flow(), handle)
    }
}

impl<T: Clone + 'static> Flow<T> {
    /// Collect on the runtime's executor into a shared flow.
    ///
    /// The shared flow is retired when this flow ends or fails; a failure is
    /// also recorded in the runtime diagnostics.
    pub fn share_in(&self, rt: &Runtime, config: SharedFlowConfig) -> (SharedFlow<T>, TaskHandle) {
        let shared = SharedFlow::new(config).named(self.label_rc());
        let (upstream, sink) = (self.clone(), shared.clone());

        let task: LocalBoxFuture<'static, Result<(), BoxError>> = Box::pin(async move {
            let mut items = upstream.stream();
            while let Some(item) = items.next().await {
                match item {
                    Ok(value) => {
                        if sink.emit(value).await.is_err() {
                            // Retired by its owner
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        sink.retire();
                        return Err(err.into());
                    }
                }
            }
            sink.retire();
            Ok(())
        });

        let id = rt.inner.allocate_task_id();
        let handle = spawn_task(
            &*rt.spawner(),
            id,
            CancelToken::new(),
            task,
            Some(stream_failure_hook(rt)),
        );
        (shared, handle)
    }
}

impl Composer<'_> {
    /// Read the latest value of `flow` as scope state.
    ///
    /// Returns `initial` until the flow produces a value. Collection runs in
    /// an effect keyed on the flow: handing a different flow restarts it, and
    /// disposing the scope stops it. Every collected value is written to a
    /// scope-owned cell this scope reads, so new values re-run the scope.
    #[track_caller]
    pub fn collect_as_state<T: Clone + PartialEq + 'static>(&mut self, flow: &Flow<T>, initial: T) -> T {
        let cell = self.remember_cell(move || initial);
        let source = flow.clone();
        self.launched_effect(flow.clone(), move |task| async move {
            let mut items = source.stream();
            while let Some(item) = items.next().await {
                task.write(&cell, item?);
            }
            Ok::<(), BoxError>(())
        });
        self.read(&cell)
    }
}

// =============================================================================
// TESTS
// =============================================================================
