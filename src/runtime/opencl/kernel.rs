//! Kernels: argument binding and dispatch.

use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex};

use log::{debug, error};
use opencl3::error_codes::ClError as NativeError;
use opencl3::kernel::Kernel as ClKernel;
use opencl3::types::cl_mem;

use crate::error::{ClError, Result, Status};

use super::buffer::Buffer;
use super::event::Event;
use super::image::Image;
use super::ledger::ResourceKind;
use super::memory::MemoryObject;
use super::program::CompiledProgram;
use super::queue::Queue;

const CL_INVALID_MEM_OBJECT: i32 = -38;

/// Global and optional local work sizes of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    dims: u32,
    global: [usize; 3],
    local: Option<[usize; 3]>,
}

impl WorkSize {
    /// Builds a work size of 1 to 3 dimensions.
    ///
    /// `local`, when given, must have as many dimensions as `global` and no
    /// empty dimension. Whether it must divide `global` is up to the device,
    /// which reports non-uniform groups it cannot run at dispatch.
    pub fn new(global: &[usize], local: Option<&[usize]>) -> Result<Self> {
        if global.is_empty() || global.len() > 3 {
            return Err(ClError::invalid_argument(format!(
                "work size of {} dimensions",
                global.len()
            )));
        }
        if global.contains(&0) {
            return Err(ClError::InvalidSize(format!(
                "global work size {:?} has an empty dimension",
                global
            )));
        }

        let mut work = WorkSize {
            dims: global.len() as u32,
            global: [1; 3],
            local: None,
        };
        work.global[..global.len()].copy_from_slice(global);

        if let Some(local) = local {
            if local.len() != global.len() {
                return Err(ClError::invalid_argument(format!(
                    "local work size {:?} does not match global work size {:?}",
                    local, global
                )));
            }
            if local.contains(&0) {
                return Err(ClError::InvalidSize(format!(
                    "local work size {:?} has an empty dimension",
                    local
                )));
            }
            let mut sizes = [1; 3];
            sizes[..local.len()].copy_from_slice(local);
            work.local = Some(sizes);
        }
        Ok(work)
    }

    /// One dimension. A zero `local` leaves the choice to the driver.
    pub fn d1(global: usize, local: usize) -> Self {
        Self::unchecked(1, [global, 1, 1], [local, 1, 1])
    }

    /// Two dimensions. A zero in `local` leaves the choice to the driver.
    pub fn d2(global: [usize; 2], local: [usize; 2]) -> Self {
        Self::unchecked(2, [global[0], global[1], 1], [local[0], local[1], 1])
    }

    /// Three dimensions. A zero in `local` leaves the choice to the driver.
    pub fn d3(global: [usize; 3], local: [usize; 3]) -> Self {
        Self::unchecked(3, global, local)
    }

    fn unchecked(dims: u32, global: [usize; 3], local: [usize; 3]) -> Self {
        let local = (!local[..dims as usize].contains(&0)).then_some(local);
        WorkSize {
            dims,
            global,
            local,
        }
    }

    pub fn dims(&self) -> u32 {
        self.dims
    }

    pub fn global(&self) -> &[usize] {
        &self.global[..self.dims as usize]
    }

    pub fn local(&self) -> Option<&[usize]> {
        self.local.as_ref().map(|l| &l[..self.dims as usize])
    }

    /// Total number of work items.
    pub fn total(&self) -> usize {
        self.global().iter().product()
    }
}

/// A value that can be bound to a kernel argument slot.
pub trait KernelArg {
    #[doc(hidden)]
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError>;
}

/// Plain values passed to kernels by copy.
pub trait Scalar: Copy {}

macro_rules! impl_scalar_arg {
    ($($t:ty),*) => {
        $(
            impl Scalar for $t {}

            impl KernelArg for $t {
                fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
                    unsafe { kernel.set_arg(index, self) }
                }
            }
        )*
    };
}

impl_scalar_arg!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

// Vector types such as float4 are passed as arrays.
impl<T: Scalar, const N: usize> KernelArg for [T; N] {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        unsafe { kernel.set_arg(index, self) }
    }
}

fn bind_mem(
    mem: Option<cl_mem>,
    kernel: &ClKernel,
    index: u32,
) -> std::result::Result<(), NativeError> {
    let mem = mem.ok_or(NativeError(CL_INVALID_MEM_OBJECT))?;
    unsafe { kernel.set_arg(index, &mem) }
}

impl KernelArg for Buffer {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        bind_mem(self.raw_mem(), kernel, index)
    }
}

impl KernelArg for Image {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        bind_mem(self.raw_mem(), kernel, index)
    }
}

impl KernelArg for dyn MemoryObject {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        bind_mem(self.raw_mem(), kernel, index)
    }
}

impl<T: KernelArg + ?Sized> KernelArg for Arc<T> {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        (**self).bind(kernel, index)
    }
}

/// Local memory of the given size in bytes, allocated per work group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMemory(pub usize);

impl KernelArg for LocalMemory {
    fn bind(&self, kernel: &ClKernel, index: u32) -> std::result::Result<(), NativeError> {
        unsafe { kernel.set_arg_local_buffer(index, self.0) }
    }
}

/// An entry point of a built program, bound to a default queue.
///
/// Argument binding and dispatch share one lock, so concurrent callers never
/// interleave `set_arg` calls with another caller's enqueue.
pub struct Kernel {
    name: String,
    native: Option<ClKernel>,
    args_lock: Mutex<()>,
    queue: Queue,
    // Keeps the program alive, and released after the kernel.
    program: Arc<CompiledProgram>,
}

impl Kernel {
    pub(crate) fn create(program: Arc<CompiledProgram>, name: &str, queue: Queue) -> Result<Self> {
        let Some(native_program) = program.cl_program() else {
            return Err(ClError::KernelNotFound {
                name: name.to_string(),
                status: None,
            });
        };
        let native = ClKernel::create(native_program, name).map_err(|e| {
            let status = Status::from(e);
            error!("Error creating kernel {}: {}", name, status);
            ClError::KernelNotFound {
                name: name.to_string(),
                status: Some(status),
            }
        })?;

        program.ledger().record_created(ResourceKind::Kernel);
        debug!("Created kernel {} on queue {}", name, queue.id());
        Ok(Kernel {
            name: name.to_string(),
            native: Some(native),
            args_lock: Mutex::new(()),
            queue,
            program,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments declared by the kernel.
    pub fn num_args(&self) -> Result<u32> {
        self.native()?.num_args().map_err(|e| {
            ClError::from_status(format!("argument count of kernel {}", self.name), e.into())
        })
    }

    /// Queue used when no queue is given.
    pub fn default_queue(&self) -> &Queue {
        &self.queue
    }

    /// Binds `value` to argument slot `index`.
    pub fn set_arg<A: KernelArg + ?Sized>(&self, index: u32, value: &A) -> Result<()> {
        let native = self.native()?;
        let _lock = self.args_lock.lock().unwrap_or_else(|e| e.into_inner());
        value.bind(native, index).map_err(|e| {
            let status = Status::from(e);
            error!(
                "Error setting argument {} of kernel {}: {}",
                index, self.name, status
            );
            ClError::InvalidArgument {
                what: format!("argument {} of kernel {}", index, self.name),
                status: Some(status),
            }
        })
    }

    /// Enqueues on the default queue, waiting for completion when `blocking`.
    pub fn run(&self, blocking: bool, work: &WorkSize) -> Result<()> {
        self.run_on(&self.queue, blocking, work)
    }

    /// Enqueues on `queue`, waiting for completion when `blocking`.
    pub fn run_on(&self, queue: &Queue, blocking: bool, work: &WorkSize) -> Result<()> {
        let event = self.enqueue_on(queue, work)?;
        if blocking {
            event.wait()?;
        }
        Ok(())
    }

    /// Enqueues on `queue` and returns the completion event.
    pub fn enqueue_on(&self, queue: &Queue, work: &WorkSize) -> Result<Event> {
        let native = self.native()?;
        let local = work.local.as_ref().map_or(ptr::null(), |l| l.as_ptr());

        let _lock = self.args_lock.lock().unwrap_or_else(|e| e.into_inner());
        let event = unsafe {
            queue.cl_queue().enqueue_nd_range_kernel(
                native.get(),
                work.dims,
                ptr::null(),
                work.global.as_ptr(),
                local,
                &[],
            )
        }
        .map_err(|e| {
            let status = Status::from(e);
            error!(
                "Error running kernel {} with work size {:?}: {}",
                self.name,
                work.global(),
                status
            );
            ClError::DispatchFailed {
                kernel: self.name.clone(),
                status,
            }
        })?;
        Ok(Event::new(event))
    }

    /// 1D dispatch. A zero `local` leaves the choice to the driver.
    pub fn run1d(&self, blocking: bool, global: usize, local: usize) -> Result<()> {
        self.run(blocking, &WorkSize::d1(global, local))
    }

    /// 2D dispatch. A zero in `local` leaves the choice to the driver.
    pub fn run2d(&self, blocking: bool, global: [usize; 2], local: [usize; 2]) -> Result<()> {
        self.run(blocking, &WorkSize::d2(global, local))
    }

    /// 3D dispatch. A zero in `local` leaves the choice to the driver.
    pub fn run3d(&self, blocking: bool, global: [usize; 3], local: [usize; 3]) -> Result<()> {
        self.run(blocking, &WorkSize::d3(global, local))
    }

    fn native(&self) -> Result<&ClKernel> {
        self.native
            .as_ref()
            .ok_or_else(|| ClError::invalid_argument(format!("kernel {} has no native handle", self.name)))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            drop(native);
            self.program.ledger().record_released(ResourceKind::Kernel);
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish()
    }
}

// OpenCL handles thread safety internally
unsafe impl Send for Kernel {}
unsafe impl Sync for Kernel {}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_work_size_1d() {
        let work = WorkSize::new(&[1024], Some(&[64])).unwrap();
        assert_eq!(work.dims(), 1);
        assert_eq!(work.global(), &[1024]);
        assert_eq!(work.local(), Some(&[64][..]));
        assert_eq!(work.total(), 1024);
    }

    #[test]
    fn test_work_size_3d_without_local() {
        let work = WorkSize::new(&[8, 4, 2], None).unwrap();
        assert_eq!(work.dims(), 3);
        assert_eq!(work.local(), None);
        assert_eq!(work.total(), 64);
    }

    #[rstest]
    #[case(&[], None, ErrorKind::InvalidArgument)]
    #[case(&[1, 1, 1, 1], None, ErrorKind::InvalidArgument)]
    #[case(&[16, 0], None, ErrorKind::InvalidSize)]
    #[case(&[16, 16], Some(&[4][..]), ErrorKind::InvalidArgument)]
    #[case(&[16], Some(&[0][..]), ErrorKind::InvalidSize)]
    fn test_work_size_invalid(
        #[case] global: &[usize],
        #[case] local: Option<&[usize]>,
        #[case] kind: ErrorKind,
    ) {
        let err = WorkSize::new(global, local).unwrap_err();
        assert_eq!(err.kind(), kind);
    }

    #[rstest]
    #[case(WorkSize::d1(256, 0), None)]
    #[case(WorkSize::d1(256, 32), Some(vec![32]))]
    #[case(WorkSize::d2([64, 64], [8, 0]), None)]
    #[case(WorkSize::d2([64, 64], [8, 8]), Some(vec![8, 8]))]
    #[case(WorkSize::d3([8, 8, 8], [2, 2, 2]), Some(vec![2, 2, 2]))]
    fn test_work_size_driver_local(#[case] work: WorkSize, #[case] local: Option<Vec<usize>>) {
        assert_eq!(work.local().map(<[usize]>::to_vec), local);
    }

    #[test]
    fn test_work_size_non_uniform_local() {
        let work = WorkSize::new(&[100, 30], Some(&[16, 8])).unwrap();
        assert_eq!(work.global(), &[100, 30]);
        assert_eq!(work.local(), Some(&[16, 8][..]));
    }

    #[test]
    fn test_work_size_d2_global() {
        let work = WorkSize::d2([640, 480], [0, 0]);
        assert_eq!(work.global(), &[640, 480]);
        assert_eq!(work.total(), 640 * 480);
    }
}
