//! Command queues.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;

use crate::error::{ClError, Result, Status};

use super::device::Device;

static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(0);

/// A shareable handle to one in-order command queue.
///
/// Clones refer to the same native queue. Commands submitted through one
/// queue run in submission order; different queues progress independently.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<CommandQueue>,
    id: usize,
    device_index: usize,
}

impl Queue {
    /// Creates a queue on `device` within `context`.
    pub fn create(context: &Context, device: &Device) -> Result<Self> {
        // 1.2 entry point, still exported by 2.x and 3.x platforms.
        #[allow(deprecated)]
        let queue = unsafe { CommandQueue::create(context, device.id(), 0) }
            .map_err(|e| {
                let status = Status::from(e);
                error!(
                    "Error creating command queue on device {}: {}",
                    device.name(),
                    status
                );
                ClError::QueueCreationFailed {
                    device: device.index(),
                    status,
                }
            })?;

        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Created command queue {} on device {}", id, device.name());
        Ok(Queue {
            inner: Arc::new(queue),
            id,
            device_index: device.index(),
        })
    }

    /// Process-unique queue id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Index of the device this queue submits to.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    /// Submits all queued commands without waiting.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush().map_err(|e| {
            let status = Status::from(e);
            error!("Error flushing queue {}: {}", self.id, status);
            ClError::Unhandled {
                what: format!("flush queue {}", self.id),
                status,
            }
        })
    }

    /// Blocks until every command submitted to this queue has completed.
    pub fn finish(&self) -> Result<()> {
        self.inner.finish().map_err(|e| {
            let status = Status::from(e);
            error!("Error finishing queue {}: {}", self.id, status);
            ClError::WaitFailed(status)
        })
    }

    /// Returns true if both handles refer to the same native queue.
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True when this handle is the only one left for its queue.
    pub(crate) fn is_unshared(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Returns the underlying OpenCL command queue.
    pub fn cl_queue(&self) -> &CommandQueue {
        &self.inner
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("device_index", &self.device_index)
            .finish()
    }
}

// OpenCL handles thread safety internally
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}
