//! Program build and kernel dispatch tests.
//!
//! Tests skip when no OpenCL device is available.

mod common;

use clhost::prelude::*;
use clhost::runtime::opencl::ResourceKind;
use common::{
    ACCUMULATE_SOURCE, FILL_SOURCE, INDEX_2D_SOURCE, INDEX_3D_SOURCE, INVALID_SOURCE,
    REVERSE_SOURCE, i32s, setup_context, to_bytes, u32s,
};
use opencl3::event::{CL_COMPLETE, Event as ClEvent, create_user_event, set_user_event_status};

#[test]
fn test_fill_pattern_run1d() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.load_kernel("fill", program, None).unwrap();
    let buffer = context
        .create_buffer(1024 * 4, CL_MEM_READ_WRITE, None, true, None)
        .unwrap();

    let kernel = context.kernel(kernel).unwrap();
    let buffer = context.buffer(buffer).unwrap();
    assert_eq!(kernel.name(), "fill");
    assert_eq!(kernel.num_args().unwrap(), 2);

    kernel.set_arg(0, &buffer).unwrap();
    kernel.set_arg(1, &7u32).unwrap();
    kernel.run1d(true, 1024, 0).unwrap();

    let values = u32s(&buffer.to_vec(None).unwrap());
    assert_eq!(values.len(), 1024);
    for (i, value) in values.iter().enumerate() {
        assert_eq!(*value, i as u32 * 3 + 7, "mismatch at {}", i);
    }
}

#[test]
fn test_non_blocking_run_then_finish() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("fill", program, None).unwrap()).unwrap();
    let buffer = context
        .buffer(context.create_buffer(256 * 4, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.set_arg(1, &0u32).unwrap();
    kernel.run(false, &WorkSize::new(&[256], Some(&[64])).unwrap()).unwrap();
    context.finish().unwrap();

    let values = u32s(&buffer.to_vec(None).unwrap());
    assert_eq!(values[255], 255 * 3);
}

#[test]
fn test_run2d_index() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(INDEX_2D_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("index_2d", program, None).unwrap()).unwrap();
    let buffer = context
        .buffer(context.create_buffer(16 * 8 * 4, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.run2d(true, [16, 8], [0, 0]).unwrap();

    let values = u32s(&buffer.to_vec(None).unwrap());
    assert_eq!(values[0], 0);
    assert_eq!(values[15], 15);
    assert_eq!(values[16], 1000);
    assert_eq!(values[16 * 8 - 1], 7 * 1000 + 15);
}

#[test]
fn test_run3d_index() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(INDEX_3D_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("index_3d", program, None).unwrap()).unwrap();
    let buffer = context
        .buffer(context.create_buffer(8 * 4 * 2 * 4, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.run3d(true, [8, 4, 2], [2, 2, 1]).unwrap();

    let values = u32s(&buffer.to_vec(None).unwrap());
    assert_eq!(values.len(), 64);
    assert_eq!(values[0], 0);
    assert_eq!(values[7], 7);
    assert_eq!(values[8], 100);
    assert_eq!(values[32], 10000);
    assert_eq!(values[63], 10000 + 300 + 7);
}

#[test]
fn test_flush_then_finish() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("fill", program, None).unwrap()).unwrap();
    let buffer = context
        .buffer(context.create_buffer(128 * 4, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.set_arg(1, &5u32).unwrap();
    let event = kernel.enqueue_on(kernel.default_queue(), &WorkSize::d1(128, 0)).unwrap();
    context.flush().unwrap();
    context.finish().unwrap();
    assert!(event.is_complete());
    assert_eq!(u32s(&buffer.to_vec(None).unwrap())[127], 127 * 3 + 5);
}

#[test]
fn test_local_memory_argument() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(REVERSE_SOURCE).unwrap();
    let kernel = context
        .kernel(context.load_kernel("reverse_groups", program, None).unwrap())
        .unwrap();
    let input: Vec<i32> = (0..16).collect();
    let buffer = context
        .buffer(
            context
                .create_buffer(16 * 4, CL_MEM_READ_WRITE, Some(&to_bytes(&input)), true, None)
                .unwrap(),
        )
        .unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.set_arg(1, &LocalMemory(4 * 4)).unwrap();
    kernel.run1d(true, 16, 4).unwrap();

    let values = i32s(&buffer.to_vec(None).unwrap());
    assert_eq!(&values[..8], &[3, 2, 1, 0, 7, 6, 5, 4]);
}

#[test]
fn test_invalid_source_fails_build() {
    let Some(context) = setup_context() else {
        return;
    };

    let err = context.load_program_from_source(INVALID_SOURCE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BuildFailed);

    let ClError::BuildFailed { program, .. } = err else {
        unreachable!();
    };
    let program = program.expect("failed program is registered");
    assert_eq!(context.num_programs(), 1);
    assert!(!context.program(program).unwrap().is_built());

    for _ in 0..2 {
        let err = context.load_kernel("broken", program, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KernelNotFound);
    }
    assert_eq!(context.num_kernels(), 0);
}

#[test]
fn test_missing_entry_point() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let err = context.load_kernel("does_not_exist", program, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KernelNotFound);
    assert!(err.status().is_some());
}

#[test]
fn test_set_arg_out_of_range() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("fill", program, None).unwrap()).unwrap();
    let err = kernel.set_arg(5, &1u32).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_program_cache_reuses_build() {
    let Some(context) = setup_context() else {
        return;
    };

    let first = context.load_program_from_source(FILL_SOURCE).unwrap();
    let second = context.load_program_from_source(FILL_SOURCE).unwrap();
    assert_ne!(first, second);
    assert_eq!(context.num_programs(), 2);
    assert_eq!(context.ledger().created(ResourceKind::Program), 1);
    assert_eq!(context.program_cache_stats(), (1, 1));

    context.clear_program_cache();
    context.load_program_from_source(FILL_SOURCE).unwrap();
    assert_eq!(context.ledger().created(ResourceKind::Program), 2);
}

#[test]
fn test_delete_kernel() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.load_kernel("fill", program, None).unwrap();
    assert_eq!(context.num_kernels(), 1);

    assert!(context.delete_kernel(kernel));
    assert_eq!(context.num_kernels(), 0);
    assert!(context.kernel(kernel).is_none());
    assert_eq!(context.ledger().outstanding(ResourceKind::Kernel), 0);

    // The program stays usable.
    assert!(context.load_kernel("fill", program, None).is_ok());
}

#[test]
fn test_concurrent_queues() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(ACCUMULATE_SOURCE).unwrap();
    let queues = [
        context.create_additional_queue(0).unwrap(),
        context.create_additional_queue(0).unwrap(),
    ];
    assert!(!queues[0].same_queue(&queues[1]));

    let jobs: Vec<_> = queues
        .iter()
        .enumerate()
        .map(|(i, queue)| {
            let kernel = context
                .kernel(context.load_kernel("accumulate", program, Some(queue)).unwrap())
                .unwrap();
            let buffer = context
                .buffer(context.create_buffer(4096 * 4, CL_MEM_READ_WRITE, None, true, Some(queue)).unwrap())
                .unwrap();
            buffer.write(&vec![0u8; 4096 * 4], 0, true, Some(queue)).unwrap();
            kernel.set_arg(0, &buffer).unwrap();
            kernel.set_arg(1, &(i as i32 + 1)).unwrap();
            kernel.set_arg(2, &1000i32).unwrap();
            (kernel, buffer)
        })
        .collect();

    std::thread::scope(|s| {
        for (queue, (kernel, _)) in queues.iter().zip(&jobs) {
            s.spawn(move || {
                kernel.run1d(false, 4096, 0).unwrap();
                queue.finish().unwrap();
            });
        }
    });

    for (i, (queue, (_, buffer))) in queues.iter().zip(&jobs).enumerate() {
        let values = i32s(&buffer.to_vec(Some(queue)).unwrap());
        let expected = (i as i32 + 1) * 1000;
        assert!(values.iter().all(|&v| v == expected), "queue {} produced wrong values", i);
    }
}

#[test]
fn test_additional_queue_invalid_device() {
    let Some(context) = setup_context() else {
        return;
    };

    let err = context.create_additional_queue(usize::MAX).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueCreationFailed);
}

#[test]
fn test_additional_queue_finishes_independently() {
    let Some(context) = setup_context() else {
        return;
    };

    // Hold the default queue behind a barrier on an unsignalled user event.
    let shared = context.shared().unwrap();
    let gate = ClEvent::new(create_user_event(shared.context().get()).unwrap());
    let default_queue = context.default_queue().unwrap();
    let _barrier = unsafe {
        default_queue
            .cl_queue()
            .enqueue_barrier_with_wait_list(&[gate.get()])
    }
    .unwrap();

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let kernel = context.kernel(context.load_kernel("fill", program, None).unwrap()).unwrap();
    let work = WorkSize::d1(64, 0);

    let held = context
        .buffer(context.create_buffer(64 * 4, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();
    kernel.set_arg(0, &held).unwrap();
    kernel.set_arg(1, &1u32).unwrap();
    let held_run = kernel.enqueue_on(default_queue, &work).unwrap();

    let queue = context.create_additional_queue(0).unwrap();
    let free = context
        .buffer(context.create_buffer(64 * 4, CL_MEM_READ_WRITE, None, true, Some(&queue)).unwrap())
        .unwrap();
    kernel.set_arg(0, &free).unwrap();
    kernel.set_arg(1, &2u32).unwrap();
    kernel.run_on(&queue, false, &work).unwrap();
    queue.finish().unwrap();

    assert_eq!(u32s(&free.to_vec(Some(&queue)).unwrap())[63], 63 * 3 + 2);
    assert!(!held_run.is_complete());

    set_user_event_status(gate.get(), CL_COMPLETE).unwrap();
    context.finish().unwrap();
    assert!(held_run.is_complete());
    assert_eq!(u32s(&held.to_vec(None).unwrap())[63], 63 * 3 + 1);
}

#[test]
fn test_unused_additional_queues_are_released() {
    let Some(context) = setup_context() else {
        return;
    };

    let kept = context.create_additional_queue(0).unwrap();
    drop(context.create_additional_queue(0).unwrap());
    assert_eq!(context.num_additional_queues(), 2);

    // Creating another queue drops the one nobody holds.
    let _latest = context.create_additional_queue(0).unwrap();
    assert_eq!(context.num_additional_queues(), 2);
    kept.finish().unwrap();
}
