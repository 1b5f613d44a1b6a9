//! Stable callback indirection.
//!
//! A [`CallbackSlot`] is registered once with the dispatcher; re-registering
//! a handler swaps what the slot points at, so every dispatch reaches the
//! latest version instead of the one captured at registration.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Shared, swappable callback.
pub struct CallbackSlot<T> {
    inner: Arc<RwLock<Handler<T>>>,
}

impl<T> Clone for CallbackSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CallbackSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot").finish_non_exhaustive()
    }
}

impl<T> CallbackSlot<T> {
    /// Create a slot holding `f`.
    pub fn new(f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(f))),
        }
    }

    /// Replace the handler. Clones of this slot see the new one.
    pub fn set(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        *self.inner.write() = Arc::new(f);
    }

    /// Invoke the current handler.
    ///
    /// The lock is released before the call, so the handler may call
    /// [`CallbackSlot::set`] on its own slot.
    pub fn call(&self, value: &T) {
        let handler: Handler<T> = self.inner.read().clone();
        handler(value);
    }

    /// Whether two slots share the same indirection.
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
