//! Memory objects: the shared base of buffers and images.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use opencl3::memory::ClMem;
use opencl3::types::{cl_mem, cl_mem_flags};

pub use opencl3::memory::{
    CL_MEM_ALLOC_HOST_PTR, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE,
    CL_MEM_USE_HOST_PTR, CL_MEM_WRITE_ONLY,
};

use crate::error::{ClError, Result};

use super::event::{PendingTransfer, StagedWrites};
use super::ledger::{ReleaseLedger, ResourceKind};

/// Access and allocation flags of a memory object.
pub type MemFlags = cl_mem_flags;

static RELEASE_LOCK: Mutex<()> = Mutex::new(());

/// Takes the process-wide release lock when `enabled`.
pub(crate) fn release_guard(enabled: bool) -> Option<MutexGuard<'static, ()>> {
    enabled.then(|| RELEASE_LOCK.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Concrete kind of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Buffer,
    Image,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Buffer => write!(f, "buffer"),
            MemoryKind::Image => write!(f, "image"),
        }
    }
}

/// Anything backed by exactly one native memory handle.
pub trait MemoryObject: Send + Sync + 'static {
    fn kind(&self) -> MemoryKind;

    fn flags(&self) -> MemFlags;

    /// Size of the device allocation in bytes.
    fn size(&self) -> usize;

    /// True if the storage is shared with an OpenGL object.
    fn is_gl_shared(&self) -> bool;

    /// Native handle, `None` once released.
    fn raw_mem(&self) -> Option<cl_mem>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Owner of one native memory handle.
///
/// The handle is released exactly once, when the owner drops. Uploads that
/// were issued without blocking are waited for first, since the device may
/// still be reading their staging copies.
pub(crate) struct MemHandle<M> {
    native: RwLock<Option<M>>,
    staged: Mutex<StagedWrites>,
    serialize: bool,
    ledger: Arc<ReleaseLedger>,
}

impl<M: ClMem> MemHandle<M> {
    pub(crate) fn new(native: M, serialize: bool, ledger: Arc<ReleaseLedger>) -> Self {
        ledger.record_created(ResourceKind::Memory);
        MemHandle {
            native: RwLock::new(Some(native)),
            staged: Mutex::new(StagedWrites::default()),
            serialize,
            ledger,
        }
    }

    pub(crate) fn raw(&self) -> Option<cl_mem> {
        self.read().as_ref().map(|m| m.get())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Option<M>> {
        self.native.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Option<M>> {
        self.native.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialises a transfer with every release when the release lock is on.
    pub(crate) fn transfer_guard(&self) -> Option<MutexGuard<'static, ()>> {
        release_guard(self.serialize)
    }

    pub(crate) fn stage(&self, transfer: PendingTransfer) {
        self.staged_writes().push(transfer);
    }

    /// Waits for every upload issued without blocking.
    pub(crate) fn sync(&self) -> Result<()> {
        self.staged_writes().wait_all()
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.staged_writes().len()
    }

    fn staged_writes(&self) -> MutexGuard<'_, StagedWrites> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<M> Drop for MemHandle<M> {
    fn drop(&mut self) {
        let staged = self.staged.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = staged.wait_all() {
            log::error!("Pending upload failed before release: {}", e);
        }

        let native = self
            .native
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(native) = native {
            let _guard = release_guard(self.serialize);
            drop(native);
            self.ledger.record_released(ResourceKind::Memory);
        }
    }
}

// OpenCL handles thread safety internally
unsafe impl<M> Send for MemHandle<M> {}
unsafe impl<M> Sync for MemHandle<M> {}

pub(crate) fn released_error(what: &str) -> ClError {
    ClError::invalid_argument(format!("{} on a released memory object", what))
}

/// Checks that `[offset, offset + len)` lies inside an allocation of `size`
/// bytes.
pub(crate) fn check_range(what: &str, offset: usize, len: usize, size: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(ClError::InvalidSize(format!(
            "{} of {} bytes at offset {} exceeds {} byte allocation",
            what, len, offset, size
        ))),
    }
}

/// Validates a requested allocation size against the device limit.
pub(crate) fn validate_alloc_size(size: usize, max_alloc: u64) -> Result<()> {
    if size == 0 {
        return Err(ClError::InvalidSize("allocation of 0 bytes".into()));
    }
    if size as u64 > max_alloc {
        return Err(ClError::InvalidSize(format!(
            "allocation of {} bytes exceeds device maximum of {} bytes",
            size, max_alloc
        )));
    }
    Ok(())
}
