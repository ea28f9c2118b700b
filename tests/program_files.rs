//! Loading programs from files and include paths.

mod common;

use std::fs;

use clhost::prelude::*;
use common::{FILL_SOURCE, setup_context, setup_context_with, u32s};

#[test]
fn test_load_program_from_file() {
    let Some(context) = setup_context() else {
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fill.cl");
    fs::write(&path, FILL_SOURCE).unwrap();

    let program = context.load_program_from_file(&path, false, None).unwrap();
    let entry = context.program(program).unwrap();
    assert!(entry.is_built());
    assert_eq!(entry.label(), path.display().to_string());
    assert!(context.load_kernel("fill", program, None).is_ok());
}

#[test]
fn test_missing_file() {
    let Some(context) = setup_context() else {
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let err = context
        .load_program_from_file(dir.path().join("missing.cl"), false, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceReadError);
    assert_eq!(context.num_programs(), 0);
}

#[test]
fn test_binary_program_not_implemented() {
    let Some(context) = setup_context() else {
        return;
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fill.bin");
    fs::write(&path, [0u8; 16]).unwrap();

    let err = context.load_program_from_file(&path, true, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotImplemented);
}

#[test]
fn test_include_root_and_build_options() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("values.h"), "#define BASE 40u\n").unwrap();
    let config = ComputeConfig::default()
        .with_set_current(false)
        .with_include_root(dir.path())
        .with_build_options("-DEXTRA=2u");
    let Some(context) = setup_context_with(config) else {
        return;
    };

    let source = r#"
#include "values.h"
__kernel void constant_fill(__global uint* out) {
    out[get_global_id(0)] = BASE + EXTRA;
}
"#;
    let program = context.load_program_from_source(source).unwrap();
    let options = context.program(program).unwrap().options().to_string();
    assert!(options.starts_with("-I \""));
    assert!(options.ends_with("-DEXTRA=2u"));

    let kernel = context
        .kernel(context.load_kernel("constant_fill", program, None).unwrap())
        .unwrap();
    let buffer = context
        .buffer(context.create_buffer(16, CL_MEM_READ_WRITE, None, true, None).unwrap())
        .unwrap();
    kernel.set_arg(0, &buffer).unwrap();
    kernel.run1d(true, 4, 0).unwrap();
    assert_eq!(u32s(&buffer.to_vec(None).unwrap()), vec![42; 4]);
}

#[test]
fn test_program_binaries() {
    let Some(context) = setup_context() else {
        return;
    };

    let program = context.load_program_from_source(FILL_SOURCE).unwrap();
    let program = context.program(program).unwrap();
    let binaries = program.binaries().unwrap();
    assert_eq!(binaries.len(), context.devices().len());
    program.log_binaries();
}
