//! clhost: OpenCL host-side resource management
//!
//! clhost discovers compute devices, sets up a context with command queues,
//! builds programs, and tracks kernels and device memory until they are
//! released.
//!
//! # Architecture
//!
//! clhost provides:
//! - **runtime::opencl**: devices, queues, programs, kernels, buffers and images
//! - **registry**: id-keyed registries the context stores its objects in
//! - **interop**: handles of OpenGL buffers and textures shared with the device
//! - **global**: the optional process-wide current context
//! - **config**: context settings with environment overrides
//! - **error**: the error taxonomy and native status translation
//!
//! # Example
//! ```ignore
//! use clhost::prelude::*;
//!
//! let mut context = ComputeContext::default();
//! context.setup(DeviceType::Gpu)?;
//!
//! let program = context.load_program_from_source(SOURCE)?;
//! let kernel = context.load_kernel("fill", program, None)?;
//! let buffer = context.create_buffer(4096, CL_MEM_READ_WRITE, None, true, None)?;
//!
//! let kernel = context.kernel(kernel).unwrap();
//! kernel.set_arg(0, &context.buffer(buffer).unwrap())?;
//! kernel.run1d(true, 1024, 0)?;
//! ```

// ============================================================================
// Core Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod global;
pub mod interop;
pub mod registry;
pub mod runtime;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::ComputeConfig;
pub use error::{ClError, ErrorKind, Result, Status, error_as_str};
pub use registry::{Id, KernelId, MemId, ProgramId, Registry};
pub use runtime::opencl::{
    Buffer, ComputeContext, Device, DeviceInfo, DeviceSelection, DeviceType, Event, Image,
    ImageFormat, Kernel, MemoryObject, Program, Queue, WorkSize,
};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::config::ComputeConfig;
    pub use crate::error::{ClError, ErrorKind, Result};
    pub use crate::registry::{KernelId, MemId, ProgramId};
    pub use crate::runtime::opencl::memory::{
        CL_MEM_ALLOC_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY,
    };
    pub use crate::runtime::opencl::{
        Buffer, ChannelOrder, ChannelType, ComputeContext, DeviceSelection, DeviceType, Image,
        ImageFormat, Kernel, KernelArg, LocalMemory, MemoryObject, Queue, WorkSize,
    };
}
