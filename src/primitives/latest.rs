// ============================================================================
// spark-recompose - Latest Value
// A remembered holder refreshed on every run, read by long-lived tasks
// ============================================================================

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Current value of something a scope computed on its most recent run.
///
/// An effect keyed on `()` never restarts, yet often needs the newest value
/// of a callback or setting. `Composer::latest` remembers one `Latest` per
/// call-site and overwrites it on each run; the task keeps a clone and reads
/// it whenever it needs to.
///
/// ```ignore
/// let on_tick = cx.latest(current_handler.clone());
/// cx.launched_effect((), move |task| async move {
///     loop {
///         task.sleep(Duration::from_secs(1)).await?;
///         (on_tick.get())();
///     }
/// });
/// ```
pub struct Latest<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> Latest<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    pub(crate) fn replace(&self, value: T) -> T {
        self.inner.replace(value)
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.inner.borrow().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow())
    }
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Latest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Latest").field(&*self.inner.borrow()).finish()
    }
}
