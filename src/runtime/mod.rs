//! Runtime backends.

pub mod opencl;
