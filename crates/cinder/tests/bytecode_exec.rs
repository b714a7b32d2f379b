//! Integration tests for running pre-compiled bytecode in a sandbox.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use cinder::{
    CompileOptions, CompilerContext, CompilerOptions, Error, Sandbox, TaskStatus, Value, Vm,
    bytecode,
};

fn image(source: &str, strip_locals: bool) -> Vec<u8> {
    let mut context = CompilerContext::new(CompilerOptions::default());
    let mut program = context.load(source.as_bytes()).unwrap();
    if strip_locals {
        context.strip_locals(&mut program);
    }
    context.resolve_symbols(&mut program).unwrap();
    bytecode::encode(&program).unwrap()
}

// =============================================================================
// exec_bytecode
// =============================================================================

#[test]
fn test_exec_bytecode_runs_image() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    sandbox
        .exec_bytecode(&image("a = 40\nb = 2\na + b", false))
        .unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Finished);
    assert_eq!(sandbox.result(), Value::Int(42));
    assert!(sandbox.has_program());
}

#[test]
fn test_exec_bytecode_stripped_image() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    sandbox
        .exec_bytecode(&image("s = \"ab\"\ns * 3", true))
        .unwrap();
    assert_eq!(sandbox.result(), Value::from("ababab"));
}

#[test]
fn test_execute_reruns_injected_program() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    sandbox.exec_bytecode(&image("suspend\n9", false)).unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Suspended);

    sandbox.execute().unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Suspended);
}

#[test]
fn test_exec_bytecode_after_failed_compile() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    sandbox
        .compile("while", CompileOptions::default())
        .unwrap_err();
    assert!(!sandbox.has_program());

    sandbox.exec_bytecode(&image("1 + 2", false)).unwrap();
    assert_eq!(sandbox.result(), Value::Int(3));

    // The decoded program needs no compiler context to rerun.
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::Int(3));
}

#[test]
fn test_malformed_image_raises_load_error() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();

    sandbox.exec_bytecode(b"not bytecode at all").unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Raised);
    let error = sandbox.error().expect("load error");
    assert_eq!(error.class, "LoadError");
    assert!(error.message.contains("magic"), "{}", error.message);

    let mut corrupted = image("1", false);
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0x55;
    sandbox.exec_bytecode(&corrupted).unwrap();
    let error = sandbox.error().expect("load error");
    assert_eq!(error.class, "LoadError");
    assert!(error.message.contains("checksum"), "{}", error.message);
}

#[test]
fn test_bytecode_and_source_agree() {
    let source = "i = 0\nacc = 1\nwhile i < 10\n  acc = acc * 2\n  i = i + 1\nend\nacc";
    let vm = Vm::new();

    let mut compiled = Sandbox::new(&vm).unwrap();
    compiled.compile(source, CompileOptions::default()).unwrap();
    compiled.execute().unwrap();

    let mut injected = Sandbox::new(&vm).unwrap();
    injected.exec_bytecode(&image(source, false)).unwrap();

    assert_eq!(compiled.result(), Value::Int(1024));
    assert_eq!(injected.result(), compiled.result());
}

// =============================================================================
// exec_bytecode_from_memory
// =============================================================================

#[test]
fn test_exec_bytecode_from_memory() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    let address = vm.memory().stage(&image("\"staged\"", false)).unwrap();
    sandbox.exec_bytecode_from_memory(address).unwrap();
    assert_eq!(sandbox.result(), Value::from("staged"));
}

#[test]
fn test_exec_bytecode_from_memory_validates_address() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();

    for address in [0, -1] {
        let err = sandbox.exec_bytecode_from_memory(address).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument {
                field: "address",
                ..
            }
        ));
    }

    let err = sandbox.exec_bytecode_from_memory(0x10).unwrap_err();
    assert!(matches!(err, Error::Memory(_)), "{err:?}");

    // Rejected calls leave the placeholder in place.
    assert!(sandbox.has_program());
    assert_eq!(sandbox.state(), TaskStatus::Suspended);
}

#[test]
fn test_exec_bytecode_from_memory_malformed_region() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::new(&vm).unwrap();
    let address = vm.memory().stage(b"CNDR").unwrap();
    sandbox.exec_bytecode_from_memory(address).unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Raised);
    assert!(sandbox.error().unwrap().is_a("LoadError"));
}
