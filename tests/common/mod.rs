//! Shared helpers for the integration tests.

#![allow(dead_code)]

use clhost::prelude::*;

/// Writes `out[i] = i * 3 + seed`.
pub const FILL_SOURCE: &str = r#"
__kernel void fill(__global uint* out, uint seed) {
    size_t i = get_global_id(0);
    out[i] = (uint)i * 3u + seed;
}
"#;

/// Adds `amount` to every element `rounds` times, to keep a queue busy.
pub const ACCUMULATE_SOURCE: &str = r#"
__kernel void accumulate(__global int* data, int amount, int rounds) {
    size_t i = get_global_id(0);
    int value = data[i];
    for (int r = 0; r < rounds; r++) {
        value += amount;
    }
    data[i] = value;
}
"#;

/// Reverses each work group's slice through local memory.
pub const REVERSE_SOURCE: &str = r#"
__kernel void reverse_groups(__global int* data, __local int* scratch) {
    size_t lid = get_local_id(0);
    size_t size = get_local_size(0);
    scratch[lid] = data[get_global_id(0)];
    barrier(CLK_LOCAL_MEM_FENCE);
    data[get_global_id(0)] = scratch[size - 1 - lid];
}
"#;

/// Writes the flattened 2D index of every work item.
pub const INDEX_2D_SOURCE: &str = r#"
__kernel void index_2d(__global uint* out) {
    size_t x = get_global_id(0);
    size_t y = get_global_id(1);
    out[y * get_global_size(0) + x] = (uint)(y * 1000 + x);
}
"#;

/// Writes `z * 10000 + y * 100 + x` for every work item.
pub const INDEX_3D_SOURCE: &str = r#"
__kernel void index_3d(__global uint* out) {
    size_t x = get_global_id(0);
    size_t y = get_global_id(1);
    size_t z = get_global_id(2);
    size_t w = get_global_size(0);
    size_t h = get_global_size(1);
    out[(z * h + y) * w + x] = (uint)(z * 10000 + y * 100 + x);
}
"#;

pub const INVALID_SOURCE: &str = r#"
__kernel void broken(__global int* out) {
    out[0] = undefined_symbol;
}
"#;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sets up a context on any device, or returns `None` so the test can skip.
pub fn setup_context() -> Option<ComputeContext> {
    setup_context_with(ComputeConfig::default().with_set_current(false))
}

pub fn setup_context_with(config: ComputeConfig) -> Option<ComputeContext> {
    init_logger();
    let mut context = ComputeContext::new(config);
    match context.setup(DeviceType::All) {
        Ok(()) => Some(context),
        Err(e) => {
            eprintln!("OpenCL device not available: {}", e);
            None
        }
    }
}

pub fn to_bytes<T: Copy>(values: &[T]) -> Vec<u8> {
    let len = std::mem::size_of_val(values);
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, len) }.to_vec()
}

pub fn u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
