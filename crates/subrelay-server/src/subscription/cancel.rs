//! One-shot cancellation handles.

use std::fmt;

use parking_lot::Mutex;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Stops one upstream operation and its forwarding.
///
/// The wrapped action runs at most once, no matter how many times
/// [`cancel`](Self::cancel) is called or from which task.
pub struct CancelHandle {
    action: Mutex<Option<CancelFn>>,
}

impl CancelHandle {
    /// Wrap a cancellation action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// A handle with nothing to do.
    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    /// Run the action if it has not run yet.
    ///
    /// Returns `true` on the call that actually ran it.
    pub fn cancel(&self) -> bool {
        // take under the lock, run outside it
        let action = self.action.lock().take();
        match action {
            Some(action) => {
                action();
                true
            }
            None => false,
        }
    }

    /// Whether the action has already run (or there never was one).
    pub fn is_spent(&self) -> bool {
        self.action.lock().is_none()
    }

    /// Combine two handles into one that cancels both, `self` first.
    #[must_use]
    pub fn then(self, next: CancelHandle) -> CancelHandle {
        CancelHandle::new(move || {
            let _ = self.cancel();
            let _ = next.cancel();
        })
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("spent", &self.is_spent())
            .finish()
    }
}
