//! The process-wide current context.

mod common;

use clhost::global;
use clhost::prelude::*;

#[test]
fn test_current_context_follows_setup_and_teardown() {
    common::init_logger();
    assert!(!global::has_current());

    let mut context = ComputeContext::default();
    if let Err(e) = context.setup(DeviceType::All) {
        eprintln!("OpenCL device not available: {}", e);
        return;
    }

    let current = global::current().expect("setup publishes the context");
    assert!(std::sync::Arc::ptr_eq(&current, context.shared().unwrap()));
    let queue = global::default_queue().unwrap();
    assert!(queue.same_queue(context.default_queue().unwrap()));
    assert_eq!(global::with_current(|shared| shared.devices().len()), Some(context.devices().len()));
    drop(current);

    // A second context without publishing leaves the current one alone.
    let mut quiet = ComputeContext::new(ComputeConfig::default().with_set_current(false));
    quiet.setup(DeviceType::All).unwrap();
    drop(quiet);
    assert!(global::has_current());

    drop(context);
    assert!(!global::has_current());
    assert!(global::default_queue().is_none());
}
