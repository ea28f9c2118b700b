//! Process-wide current context
//!
//! A convenience default for callers that do not want to pass a context
//! around. Nothing in the crate relies on it: every operation takes its
//! context or queue explicitly.
//!
//! The current context is held weakly, so it never keeps a torn-down context
//! alive.
//!
//! # Example
//! ```ignore
//! use clhost::{global, ComputeContext, DeviceType};
//!
//! let mut context = ComputeContext::default();
//! context.setup(DeviceType::Gpu)?;
//!
//! // Somewhere without access to `context`
//! let queue = global::default_queue().expect("no current context");
//! queue.finish()?;
//! ```

use std::sync::{Arc, RwLock, Weak};

use log::debug;

use crate::runtime::opencl::{Queue, SharedContext};

static CURRENT: RwLock<Option<Weak<SharedContext>>> = RwLock::new(None);

/// Make `shared` the current context.
pub fn set_current(shared: &Arc<SharedContext>) {
    debug!("Set current compute context");
    *CURRENT.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(shared));
}

/// Clear the current context, but only if it is `shared`.
pub fn clear_current(shared: &Arc<SharedContext>) {
    let mut current = CURRENT.write().unwrap_or_else(|e| e.into_inner());
    let is_current = current
        .as_ref()
        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(shared)));
    if is_current {
        debug!("Clear current compute context");
        *current = None;
    }
}

/// The current context, if one is set and still alive.
pub fn current() -> Option<Arc<SharedContext>> {
    CURRENT
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .and_then(Weak::upgrade)
}

/// Check if a live current context is set
pub fn has_current() -> bool {
    current().is_some()
}

/// Default queue of the current context.
pub fn default_queue() -> Option<Queue> {
    current().map(|shared| shared.default_queue().clone())
}

/// Run a closure against the current context.
///
/// Returns `None` without calling `f` if there is no current context.
pub fn with_current<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Arc<SharedContext>) -> R,
{
    current().map(|shared| f(&shared))
}
