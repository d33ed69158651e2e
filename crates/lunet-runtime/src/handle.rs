//! Handle context lifecycle (spec §4.4).
//!
//! A handle context is shared between the script (which holds the opaque
//! handle) and the event loop (which holds it from inside whichever
//! in-flight requests reference it). Spec §9 resolves the refcount
//! question for this port by letting `Arc<HandleInner<T>>` subsume it
//! directly rather than hand-rolling one, while keeping `closing` a
//! distinct flag: a context may legally outlive a close if writes are
//! still in flight (spec §8 scenario 3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct HandleInner<T> {
    closing: AtomicBool,
    data: Mutex<Option<T>>,
}

/// A shared, refcounted handle to a resource of type `T`.
///
/// Cloning bumps the refcount the same way `retain` did in the source;
/// dropping the last clone releases it, the same way `release` did.
pub struct HandleCtx<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for HandleCtx<T> {
    fn clone(&self) -> Self {
        HandleCtx {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> HandleCtx<T> {
    pub fn new(data: T) -> Self {
        HandleCtx {
            inner: Arc::new(HandleInner {
                closing: AtomicBool::new(false),
                data: Mutex::new(Some(data)),
            }),
        }
    }

    /// Number of references currently outstanding, mirroring the source's
    /// explicit `ref_count` field.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Mark the handle as closing. Returns the previous value so callers
    /// can detect a double-close.
    pub fn mark_closing(&self) -> bool {
        self.inner.closing.swap(true, Ordering::AcqRel)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Run `f` over the handle's data, returning `None` if `take_data` has
    /// already emptied it (the script-visible "close nulled `handle.data`"
    /// state from spec §8 scenario 3).
    pub fn with_data<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.data.lock();
        guard.as_mut().map(f)
    }

    /// Take the data out, leaving the handle in the "closed" state any
    /// in-flight completion callback must check for.
    pub fn take_data(&self) -> Option<T> {
        self.inner.data.lock().take()
    }

    pub fn has_data(&self) -> bool {
        self.inner.data.lock().is_some()
    }
}
