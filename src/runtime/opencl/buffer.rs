//! OpenCL buffer implementation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::{debug, error};
use opencl3::error_codes::ClError as NativeError;
use opencl3::memory::Buffer as ClBuffer;
use opencl3::types::{CL_BLOCKING, CL_NON_BLOCKING, cl_mem};

use crate::error::{ClError, Result, Status};
use crate::interop::GlBuffer;

use super::context::SharedContext;
use super::event::{Event, PendingTransfer};
use super::memory::{
    CL_MEM_ALLOC_HOST_PTR, CL_MEM_USE_HOST_PTR, MemFlags, MemHandle, MemoryKind, MemoryObject,
    check_range, released_error, validate_alloc_size,
};
use super::queue::Queue;

/// Where a buffer's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Device-allocated storage.
    Device,
    /// Host-accessible storage (`CL_MEM_ALLOC_HOST_PTR`).
    HostAllocated,
    /// Storage of an OpenGL buffer object.
    GlShared,
}

impl BufferMode {
    fn from_flags(flags: MemFlags) -> Self {
        if flags & CL_MEM_ALLOC_HOST_PTR != 0 {
            BufferMode::HostAllocated
        } else {
            BufferMode::Device
        }
    }
}

/// A linear device allocation.
pub struct Buffer {
    handle: MemHandle<ClBuffer<u8>>,
    size: usize,
    flags: MemFlags,
    mode: BufferMode,
    gl_buffer: Option<GlBuffer>,
    queue: Queue,
}

impl Buffer {
    /// Allocates `size` bytes on the context's devices.
    ///
    /// Fails with `InvalidSize` for a zero size or one above the primary
    /// device's maximum allocation. `CL_MEM_USE_HOST_PTR` is rejected: the
    /// buffer would alias host memory this crate cannot keep alive.
    pub fn create(shared: &SharedContext, size: usize, flags: MemFlags) -> Result<Self> {
        validate_alloc_size(size, shared.max_mem_alloc_size()).inspect_err(|e| {
            error!("Error creating buffer: {}", e);
        })?;
        if flags & CL_MEM_USE_HOST_PTR != 0 {
            return Err(ClError::invalid_argument(
                "CL_MEM_USE_HOST_PTR buffers are not supported, use CL_MEM_ALLOC_HOST_PTR",
            ));
        }

        let native = unsafe {
            ClBuffer::<u8>::create(shared.context(), flags, size, std::ptr::null_mut())
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!("Error creating buffer of {} bytes: {}", size, status);
            ClError::from_status(format!("create buffer of {} bytes", size), status)
        })?;

        debug!("Created buffer of {} bytes", size);
        Ok(Buffer {
            handle: MemHandle::new(native, shared.release_lock(), shared.ledger().clone()),
            size,
            flags,
            mode: BufferMode::from_flags(flags),
            gl_buffer: None,
            queue: shared.default_queue().clone(),
        })
    }

    /// Wraps an existing OpenGL buffer object without copying.
    pub fn from_gl(shared: &SharedContext, gl: GlBuffer, flags: MemFlags) -> Result<Self> {
        let native = unsafe { ClBuffer::<u8>::create_from_gl_buffer(shared.context(), flags, gl.id) }
            .map_err(|e| {
                let status = Status::from(e);
                error!("Error creating buffer from GL buffer {}: {}", gl.id, status);
                ClError::InteropFailed {
                    what: format!("GL buffer {}", gl.id),
                    status: Some(status),
                }
            })?;

        debug!("Created buffer from GL buffer {} ({} bytes)", gl.id, gl.size);
        Ok(Buffer {
            handle: MemHandle::new(native, shared.release_lock(), shared.ledger().clone()),
            size: gl.size,
            flags,
            mode: BufferMode::GlShared,
            gl_buffer: Some(gl),
            queue: shared.default_queue().clone(),
        })
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// The OpenGL buffer this one shares storage with.
    pub fn gl_buffer(&self) -> Option<GlBuffer> {
        self.gl_buffer
    }

    /// Queue used when a transfer is not given one explicitly.
    pub fn default_queue(&self) -> &Queue {
        &self.queue
    }

    /// Uploads `data` at `offset`.
    ///
    /// With `blocking == false` the bytes are copied into a staging area that
    /// is kept until the upload completes, so `data` may be reused at once.
    pub fn write(
        &self,
        data: &[u8],
        offset: usize,
        blocking: bool,
        queue: Option<&Queue>,
    ) -> Result<()> {
        if blocking {
            self.enqueue_write(data, offset, true, queue)?;
        } else {
            let transfer = self.write_async(data.to_vec(), offset, queue)?;
            self.handle.stage(transfer);
        }
        Ok(())
    }

    /// Starts an upload and returns it for caller-side synchronisation.
    pub fn write_async(
        &self,
        data: Vec<u8>,
        offset: usize,
        queue: Option<&Queue>,
    ) -> Result<PendingTransfer> {
        let event = self.enqueue_write(&data, offset, false, queue)?;
        Ok(PendingTransfer::new(event, data))
    }

    fn enqueue_write(
        &self,
        data: &[u8],
        offset: usize,
        blocking: bool,
        queue: Option<&Queue>,
    ) -> Result<Event> {
        check_range("write", offset, data.len(), self.size)?;
        let queue = queue.unwrap_or(&self.queue);
        let _guard = self.handle.transfer_guard();
        let mut native = self.handle.write();
        let buffer = native.as_mut().ok_or_else(|| released_error("write"))?;
        let flag = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let event = unsafe {
            queue
                .cl_queue()
                .enqueue_write_buffer(buffer, flag, offset, data, &[])
        }
        .map_err(|e| transfer_error("write", data.len(), e))?;
        Ok(Event::new(event))
    }

    /// Downloads `out.len()` bytes starting at `offset`, blocking until done.
    pub fn read(&self, out: &mut [u8], offset: usize, queue: Option<&Queue>) -> Result<()> {
        check_range("read", offset, out.len(), self.size)?;
        let queue = queue.unwrap_or(&self.queue);
        let _guard = self.handle.transfer_guard();
        let native = self.handle.read();
        let buffer = native.as_ref().ok_or_else(|| released_error("read"))?;
        unsafe {
            queue
                .cl_queue()
                .enqueue_read_buffer(buffer, CL_BLOCKING, offset, out, &[])
        }
        .map_err(|e| transfer_error("read", out.len(), e))?;
        Ok(())
    }

    /// Starts a download of `len` bytes at `offset` without blocking.
    pub fn read_async(
        &self,
        offset: usize,
        len: usize,
        queue: Option<&Queue>,
    ) -> Result<PendingTransfer> {
        check_range("read", offset, len, self.size)?;
        let queue = queue.unwrap_or(&self.queue);
        let mut data = vec![0u8; len];
        let _guard = self.handle.transfer_guard();
        let native = self.handle.read();
        let buffer = native.as_ref().ok_or_else(|| released_error("read"))?;
        let event = unsafe {
            queue
                .cl_queue()
                .enqueue_read_buffer(buffer, CL_NON_BLOCKING, offset, data.as_mut_slice(), &[])
        }
        .map_err(|e| transfer_error("read", len, e))?;
        Ok(PendingTransfer::new(Event::new(event), data))
    }

    /// Reads the whole buffer into a new vector.
    pub fn to_vec(&self, queue: Option<&Queue>) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size];
        self.read(&mut data, 0, queue)?;
        Ok(data)
    }

    /// Enqueues a device-side copy of `len` bytes from `src` into this buffer.
    ///
    /// The copy is ordered with the other commands of the queue; call
    /// `finish` on it to wait. Copies within a single buffer are rejected.
    pub fn copy_from(
        &self,
        src: &Buffer,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        queue: Option<&Queue>,
    ) -> Result<()> {
        if std::ptr::eq(self, src) {
            return Err(ClError::invalid_argument("copy within one buffer"));
        }
        check_range("copy source", src_offset, len, src.size)?;
        check_range("copy destination", dst_offset, len, self.size)?;
        let queue = queue.unwrap_or(&self.queue);
        let _guard = self.handle.transfer_guard();

        // Lock in address order so opposite copies cannot deadlock.
        let (src_native, mut dst_native) = if (src as *const Buffer) < (self as *const Buffer) {
            let s = src.handle.read();
            (s, self.handle.write())
        } else {
            let d = self.handle.write();
            (src.handle.read(), d)
        };
        let src_buffer = src_native.as_ref().ok_or_else(|| released_error("copy"))?;
        let dst_buffer = dst_native.as_mut().ok_or_else(|| released_error("copy"))?;

        unsafe {
            queue.cl_queue().enqueue_copy_buffer(
                src_buffer, dst_buffer, src_offset, dst_offset, len, &[],
            )
        }
        .map_err(|e| transfer_error("copy", len, e))?;
        Ok(())
    }

    /// Waits for every upload issued with `blocking == false`.
    pub fn sync(&self) -> Result<()> {
        self.handle.sync()
    }

    /// Number of non-blocking uploads still holding a staging copy.
    pub fn pending_writes(&self) -> usize {
        self.handle.pending_writes()
    }
}

fn transfer_error(what: &str, len: usize, e: NativeError) -> ClError {
    let status = Status::from(e);
    error!("Error in buffer {} of {} bytes: {}", what, len, status);
    ClError::transfer(format!("buffer {}", what), status)
}

impl MemoryObject for Buffer {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Buffer
    }

    fn flags(&self) -> MemFlags {
        self.flags
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_gl_shared(&self) -> bool {
        self.mode == BufferMode::GlShared
    }

    fn raw_mem(&self) -> Option<cl_mem> {
        self.handle.raw()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::opencl::memory::CL_MEM_READ_WRITE;
    use crate::runtime::opencl::{ComputeContext, DeviceType};

    fn get_test_context() -> Option<ComputeContext> {
        let mut context = ComputeContext::default();
        context.setup(DeviceType::All).ok()?;
        Some(context)
    }

    #[rstest]
    #[case(CL_MEM_READ_WRITE, BufferMode::Device)]
    #[case(CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR, BufferMode::HostAllocated)]
    fn test_mode_from_flags(#[case] flags: MemFlags, #[case] mode: BufferMode) {
        assert_eq!(BufferMode::from_flags(flags), mode);
    }

    #[test]
    fn test_buffer_round_trip() {
        let Some(context) = get_test_context() else {
            println!("No OpenCL device available, skipping test");
            return;
        };
        let shared = context.shared().unwrap();

        let buffer = Buffer::create(shared, 64, CL_MEM_READ_WRITE).unwrap();
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.mode(), BufferMode::Device);

        let data: Vec<u8> = (0..64).collect();
        buffer.write(&data, 0, true, None).unwrap();
        assert_eq!(buffer.to_vec(None).unwrap(), data);

        let mut middle = [0u8; 8];
        buffer.read(&mut middle, 16, None).unwrap();
        assert_eq!(middle, [16, 17, 18, 19, 20, 21, 22, 23]);
    }

    #[test]
    fn test_non_blocking_write_keeps_staging_copy() {
        let Some(context) = get_test_context() else {
            println!("No OpenCL device available, skipping test");
            return;
        };
        let shared = context.shared().unwrap();
        let buffer = Buffer::create(shared, 16, CL_MEM_READ_WRITE).unwrap();

        {
            let data = vec![7u8; 16];
            buffer.write(&data, 0, false, None).unwrap();
        }
        buffer.sync().unwrap();
        assert_eq!(buffer.pending_writes(), 0);
        assert_eq!(buffer.to_vec(None).unwrap(), vec![7u8; 16]);

        let pending = buffer.read_async(4, 4, None).unwrap();
        assert_eq!(pending.wait().unwrap(), vec![7u8; 4]);
    }

    #[test]
    fn test_out_of_range_transfers() {
        let Some(context) = get_test_context() else {
            println!("No OpenCL device available, skipping test");
            return;
        };
        let shared = context.shared().unwrap();
        let buffer = Buffer::create(shared, 8, CL_MEM_READ_WRITE).unwrap();

        let err = buffer.write(&[0u8; 4], 6, true, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSize);
        let mut out = [0u8; 9];
        assert!(buffer.read(&mut out, 0, None).is_err());
        assert!(buffer.copy_from(&buffer, 0, 4, 4, None).is_err());
    }

    #[test]
    fn test_copy_between_buffers() {
        let Some(context) = get_test_context() else {
            println!("No OpenCL device available, skipping test");
            return;
        };
        let shared = context.shared().unwrap();
        let src = Buffer::create(shared, 8, CL_MEM_READ_WRITE).unwrap();
        let dst = Buffer::create(shared, 8, CL_MEM_READ_WRITE).unwrap();

        src.write(&[1, 2, 3, 4, 5, 6, 7, 8], 0, true, None).unwrap();
        dst.write(&[0; 8], 0, true, None).unwrap();
        dst.copy_from(&src, 4, 0, 4, None).unwrap();
        shared.default_queue().finish().unwrap();
        assert_eq!(dst.to_vec(None).unwrap(), vec![5, 6, 7, 8, 0, 0, 0, 0]);
    }

    #[test]
    fn test_use_host_ptr_rejected() {
        let Some(context) = get_test_context() else {
            println!("No OpenCL device available, skipping test");
            return;
        };
        let shared = context.shared().unwrap();
        let err = Buffer::create(shared, 8, CL_MEM_READ_WRITE | CL_MEM_USE_HOST_PTR).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
