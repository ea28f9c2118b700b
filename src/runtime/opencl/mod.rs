//! OpenCL runtime: devices, queues, programs, kernels and memory objects.

pub mod buffer;
mod cache;
pub mod context;
pub mod device;
pub mod event;
pub mod image;
pub mod kernel;
pub mod ledger;
pub mod memory;
pub mod program;
pub mod queue;

pub use buffer::{Buffer, BufferMode};
pub use context::{ComputeContext, SharedContext};
pub use device::{Device, DeviceInfo, DeviceSelection, DeviceType};
pub use event::{Event, PendingTransfer};
pub use image::{ChannelOrder, ChannelType, Image, ImageDims, ImageFormat};
pub use kernel::{Kernel, KernelArg, LocalMemory, WorkSize};
pub use ledger::{ReleaseLedger, ResourceKind};
pub use memory::{MemFlags, MemoryKind, MemoryObject};
pub use program::Program;
pub use queue::Queue;
