// ============================================================================
// spark-recompose - Batching
// Group multiple writes into a single recomposition pass
// ============================================================================

use crate::core::context::{FlushMode, Runtime};
use crate::reactivity::scheduling::{flush_and_record, PassPhase};

// =============================================================================
// BATCH
// =============================================================================

impl Runtime {
    /// Batch several writes so their invalidations are handled by one pass.
    ///
    /// Deferred runtimes only collect invalidations anyway; batching matters
    /// in immediate mode, where the outermost batch ends with a single pass
    /// instead of one pass per write.
    ///
    /// # Example
    ///
    /// ```
    /// use spark_recompose::{FlushMode, Runtime};
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    ///
    /// let rt = Runtime::builder().flush_mode(FlushMode::Immediate).build();
    /// let a = rt.cell(1);
    /// let b = rt.cell(2);
    /// let runs = Rc::new(Cell::new(0));
    ///
    /// let runs_in = runs.clone();
    /// let _composition = rt
    ///     .compose(move |cx| {
    ///         let _ = cx.read(&a) + cx.read(&b);
    ///         runs_in.set(runs_in.get() + 1);
    ///         Ok(())
    ///     })
    ///     .unwrap();
    /// assert_eq!(runs.get(), 1);
    ///
    /// rt.batch(|| {
    ///     rt.write(&a, 10);
    ///     rt.write(&b, 20);
    /// });
    ///
    /// // One more run, not two
    /// assert_eq!(runs.get(), 2);
    /// ```
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        self.inner.enter_batch();

        // Exit the batch even if `f` panics
        struct BatchGuard<'a> {
            rt: &'a Runtime,
        }

        impl Drop for BatchGuard<'_> {
            fn drop(&mut self) {
                let depth = self.rt.inner.exit_batch();

                // The outermost batch triggers the pass in immediate mode
                if depth == 0
                    && !std::thread::panicking()
                    && self.rt.inner.config.flush_mode == FlushMode::Immediate
                    && self.rt.phase() == PassPhase::Collecting
                {
                    flush_and_record(self.rt);
                }
            }
        }

        let _guard = BatchGuard { rt: self };
        f()
    }

    /// Whether a batch is open.
    ///
    /// ```
    /// use spark_recompose::Runtime;
    ///
    /// let rt = Runtime::new();
    /// assert!(!rt.is_batching());
    /// rt.batch(|| assert!(rt.is_batching()));
    /// assert!(!rt.is_batching());
    /// ```
    pub fn is_batching(&self) -> bool {
        self.inner.batch_depth.get() > 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn immediate() -> Runtime {
        Runtime::builder().flush_mode(FlushMode::Immediate).build()
    }

    #[test]
    fn nested_batches_flush_once() {
        let rt = immediate();
        let cell = rt.cell(0);
        let runs = Rc::new(Cell::new(0));
        let runs_in = runs.clone();

        let _comp = rt
            .compose(move |cx| {
                let _ = cx.read(&cell);
                runs_in.set(runs_in.get() + 1);
                Ok(())
            })
            .unwrap();

        rt.batch(|| {
            rt.write(&cell, 1);
            rt.batch(|| {
                rt.write(&cell, 2);
            });
            // Inner batch end does not flush
            assert_eq!(runs.get(), 1);
            rt.write(&cell, 3);
        });

        assert_eq!(runs.get(), 2);
        assert_eq!(rt.read(&cell), 3);
    }

    #[test]
    fn batch_returns_value() {
        let rt = Runtime::new();
        assert_eq!(rt.batch(|| 42), 42);
    }

    #[test]
    fn batch_exits_on_panic() {
        let rt = Runtime::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            rt.batch(|| panic!("inside batch"));
        }));
        assert!(result.is_err());
        assert!(!rt.is_batching());
    }

    #[test]
    fn deferred_batch_leaves_work_pending() {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        let _comp = rt
            .compose(move |cx| {
                let _ = cx.read(&cell);
                Ok(())
            })
            .unwrap();

        rt.batch(|| {
            rt.write(&cell, 1);
            rt.write(&cell, 2);
        });
        assert_eq!(rt.phase(), PassPhase::Collecting);
        assert_eq!(rt.flush().unwrap().passes, 1);
    }
}
