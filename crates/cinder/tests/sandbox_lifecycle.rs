//! Integration tests for the sandbox lifecycle.
//!
//! These tests drive a sandbox through compile, execute, stop, suspend and
//! terminate and check what the host observes at each step.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use cinder::{CompileOptions, CompilerOptions, Error, Sandbox, TaskStatus, Value, Vm};

fn sandbox(name: &str) -> (Vm, Sandbox) {
    let vm = Vm::new();
    let sandbox = Sandbox::builder().with_name(name).build(&vm).unwrap();
    (vm, sandbox)
}

fn run(sandbox: &mut Sandbox, script: &str) {
    sandbox.compile(script, CompileOptions::default()).unwrap();
    sandbox.execute().unwrap();
}

// =============================================================================
// Basic lifecycle
// =============================================================================

#[test]
fn test_compile_execute_raise_scenario() {
    let (_vm, mut sandbox) = sandbox("t1");
    assert_eq!(sandbox.state(), TaskStatus::Suspended);

    sandbox.compile("40 + 2", CompileOptions::default()).unwrap();
    sandbox.execute().unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Finished);
    assert_eq!(sandbox.result(), Value::Int(42));
    assert_eq!(sandbox.error(), None);

    sandbox
        .compile("raise \"boom\"", CompileOptions::default())
        .unwrap();
    sandbox.execute().unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Raised);
    let error = sandbox.error().expect("error");
    assert_eq!(error.message, "boom");
    assert_eq!(error.class, "RuntimeError");
    assert_eq!(sandbox.result(), Value::Error(error));
}

#[test]
fn test_valid_scripts_reach_a_settled_state() {
    let scripts = [
        ("1", TaskStatus::Finished),
        ("x = 3\nx * x", TaskStatus::Finished),
        ("suspend\n1", TaskStatus::Suspended),
        ("Task.current.suspend", TaskStatus::Suspended),
        ("if 1 > 2 then \"a\" else \"b\" end", TaskStatus::Finished),
        ("raise ArgumentError, \"bad\"", TaskStatus::Raised),
        ("1 / 0", TaskStatus::Raised),
        ("", TaskStatus::Finished),
    ];
    for (script, expected) in scripts {
        let (_vm, mut sandbox) = sandbox("settle");
        run(&mut sandbox, script);
        assert_eq!(sandbox.state(), expected, "script: {script:?}");
    }
}

#[test]
fn test_recompile_replaces_previous_program() {
    let (_vm, mut sandbox) = sandbox("recompile");
    run(&mut sandbox, "\"first\"");
    assert_eq!(sandbox.result(), Value::from("first"));

    run(&mut sandbox, "\"second\"");
    assert_eq!(sandbox.result(), Value::from("second"));

    // Executing again reruns the latest program from the start.
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::from("second"));
}

#[test]
fn test_execute_reruns_from_start() {
    let (_vm, mut sandbox) = sandbox("rerun");
    run(&mut sandbox, "n = 1\nsuspend\nn + 1");
    assert_eq!(sandbox.state(), TaskStatus::Suspended);
    assert_eq!(sandbox.result(), Value::Nil);

    // No resume-without-rebind: execute starts over and suspends again.
    sandbox.execute().unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Suspended);
}

// =============================================================================
// Compile failures
// =============================================================================

#[test]
fn test_failed_compile_leaves_no_program() {
    let (_vm, mut sandbox) = sandbox("broken");
    run(&mut sandbox, "1");
    assert!(sandbox.has_program());

    let err = sandbox
        .compile("if true\n  1\n", CompileOptions::default())
        .unwrap_err();
    let Error::Compile(compile) = err else {
        panic!("expected a compile error, got {err:?}");
    };
    assert_eq!(compile.filename, "(sandbox)");
    assert_eq!(compile.line, 3);

    assert!(!sandbox.has_program());
    assert!(matches!(sandbox.execute(), Err(Error::NoProgram)));
    // The task keeps its last outcome.
    assert_eq!(sandbox.state(), TaskStatus::Finished);
}

#[test]
fn test_compile_after_failure_recovers() {
    let (_vm, mut sandbox) = sandbox("recover");
    sandbox
        .compile("1 +", CompileOptions::default())
        .unwrap_err();
    run(&mut sandbox, "2 + 2");
    assert_eq!(sandbox.result(), Value::Int(4));
}

#[test]
fn test_compiler_options_persist_across_compiles() {
    let vm = Vm::new();
    let mut sandbox = Sandbox::builder()
        .with_compiler_options(CompilerOptions::default().with_filename("job.rb"))
        .build(&vm)
        .unwrap();

    sandbox.compile("unused = 1\n2", CompileOptions::default()).unwrap();
    assert_eq!(sandbox.warnings(), ["assigned but unused variable - unused"]);

    let err = sandbox.compile("(", CompileOptions::default()).unwrap_err();
    assert!(err.to_string().contains("job.rb:1:"), "{err}");
    assert_eq!(sandbox.compiler_options().filename, "job.rb");
    assert!(sandbox.warnings().is_empty());
}

#[test]
fn test_strip_locals_still_runs() {
    let (_vm, mut sandbox) = sandbox("strip");
    sandbox
        .compile(
            "total = 20\ntotal + 22",
            CompileOptions::default().with_strip_locals(true),
        )
        .unwrap();
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::Int(42));
}

// =============================================================================
// Hostile input
// =============================================================================

fn assert_too_deep(sandbox: &mut Sandbox, script: &str) {
    let err = sandbox
        .compile(script, CompileOptions::default())
        .unwrap_err();
    let Error::Compile(compile) = err else {
        panic!("expected a compile error, got {err:?}");
    };
    assert!(compile.message.contains("nesting too deep"), "{}", compile.message);
    assert!(!sandbox.has_program());
}

#[test]
fn test_long_operator_chain_is_rejected() {
    let (_vm, mut sandbox) = sandbox("chain");
    assert_too_deep(&mut sandbox, &format!("1{}", " + 1".repeat(50_000)));
    assert_too_deep(&mut sandbox, &format!("true{}", " && true".repeat(50_000)));
    assert_too_deep(&mut sandbox, &format!("2{}", " * 2 < 3 == false || nil".repeat(20_000)));

    // The sandbox is still usable afterwards.
    run(&mut sandbox, "1 + 1");
    assert_eq!(sandbox.result(), Value::Int(2));
}

#[test]
fn test_short_operator_chain_compiles() {
    let (_vm, mut sandbox) = sandbox("short-chain");
    let terms: Vec<String> = (1..=40).map(|i| i.to_string()).collect();
    run(&mut sandbox, &terms.join(" + "));
    assert_eq!(sandbox.result(), Value::Int(820));
}

#[test]
fn test_long_elsif_chain_is_rejected() {
    let (_vm, mut sandbox) = sandbox("elsif");
    let script = format!(
        "if false then 1\n{}else 2\nend",
        "elsif false then 1\n".repeat(20_000)
    );
    assert_too_deep(&mut sandbox, &script);

    let script = format!("if false then 1\n{}else 2\nend", "elsif false then 1\n".repeat(10));
    run(&mut sandbox, &script);
    assert_eq!(sandbox.result(), Value::Int(2));
}

#[test]
fn test_too_many_locals_fails_to_compile() {
    let (_vm, mut sandbox) = sandbox("locals");
    let assignments: String = (0..=usize::from(u16::MAX))
        .map(|i| format!("v{i} = {i}\n"))
        .collect();
    let err = sandbox
        .compile(&format!("{assignments}v1"), CompileOptions::default())
        .unwrap_err();
    let Error::Compile(compile) = err else {
        panic!("expected a compile error, got {err:?}");
    };
    assert!(compile.message.contains("too many local variables"), "{}", compile.message);
    assert_eq!(compile.line, u32::from(u16::MAX) + 1);
    assert!(!sandbox.has_program());
}

#[test]
fn test_signed_zero_literals_are_kept_apart() {
    let (_vm, mut sandbox) = sandbox("zero");
    run(&mut sandbox, "x = 0.0\n1 / -0.0");
    assert_eq!(sandbox.result(), Value::Float(f64::NEG_INFINITY));
}

// =============================================================================
// compile_from_memory
// =============================================================================

#[test]
fn test_compile_from_memory() {
    let (vm, mut sandbox) = sandbox("memory");
    let address = vm.memory().stage(b"6 * 7").unwrap();
    sandbox
        .compile_from_memory(address, 5, CompileOptions::default())
        .unwrap();
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::Int(42));
}

#[test]
fn test_compile_from_memory_reads_only_size_bytes() {
    let (vm, mut sandbox) = sandbox("memory-prefix");
    let address = vm.memory().stage(b"1 + 1 garbage").unwrap();
    sandbox
        .compile_from_memory(address, 5, CompileOptions::default())
        .unwrap();
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::Int(2));
}

#[test]
fn test_compile_from_memory_rejects_bad_arguments_before_compiling() {
    let (vm, mut sandbox) = sandbox("args");
    run(&mut sandbox, "7");
    let address = vm.memory().stage(b"8").unwrap();

    for (address, size, field) in [(address, 0, "size"), (address, -4, "size"), (0, 1, "address"), (-16, 1, "address")] {
        let err = sandbox
            .compile_from_memory(address, size, CompileOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, Error::InvalidArgument { field: f, .. } if f == field),
            "{err:?}"
        );
    }

    // Size is checked before address.
    let err = sandbox
        .compile_from_memory(0, 0, CompileOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { field: "size", value: 0 }));

    assert_eq!(sandbox.stats().compile_count, 1);
    assert!(sandbox.has_program());
    sandbox.execute().unwrap();
    assert_eq!(sandbox.result(), Value::Int(7));
}

#[test]
fn test_compile_from_memory_unmapped_address() {
    let (vm, mut sandbox) = sandbox("unmapped");
    run(&mut sandbox, "7");
    let address = vm.memory().stage(b"abc").unwrap();

    let err = sandbox
        .compile_from_memory(address + 1_000_000, 3, CompileOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::Memory(_)), "{err:?}");

    let err = sandbox
        .compile_from_memory(address, 4, CompileOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::Memory(_)), "{err:?}");

    assert!(sandbox.has_program());
}

#[test]
fn test_compile_from_memory_compile_failure() {
    let (vm, mut sandbox) = sandbox("bad-source");
    let address = vm.memory().stage(b"1 +").unwrap();
    let err = sandbox
        .compile_from_memory(address, 3, CompileOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::Compile(_)));
    assert!(!sandbox.has_program());
}

// =============================================================================
// stop / suspend / terminate
// =============================================================================

#[test]
fn test_stop_twice_reports_already_stopped() {
    let (_vm, mut sandbox) = sandbox("stop");
    sandbox.stop().unwrap();
    assert_eq!(sandbox.state(), TaskStatus::Stopped);

    let err = sandbox.stop().unwrap_err();
    assert!(matches!(err, Error::AlreadyStopped));
    assert_eq!(err.to_string(), "Already stopped");
}

#[test]
fn test_stop_finished_task_fails() {
    let (_vm, mut sandbox) = sandbox("stop-finished");
    run(&mut sandbox, "1");
    assert!(matches!(sandbox.stop(), Err(Error::AlreadyStopped)));
}

#[test]
fn test_stopped_task_can_be_rerun() {
    let (_vm, mut sandbox) = sandbox("restart");
    sandbox.stop().unwrap();
    run(&mut sandbox, "5 - 3");
    assert_eq!(sandbox.state(), TaskStatus::Finished);
    assert_eq!(sandbox.result(), Value::Int(2));
}

#[test]
fn test_suspend_is_a_noop_on_settled_tasks() {
    let (_vm, mut sandbox) = sandbox("suspend");
    run(&mut sandbox, "1");
    sandbox.suspend();
    assert_eq!(sandbox.state(), TaskStatus::Finished);

    sandbox.stop().unwrap_err();
    sandbox.terminate();
    sandbox.suspend();
    assert_eq!(sandbox.state(), TaskStatus::Terminated);
}

#[test]
fn test_terminate_clears_result_and_is_idempotent() {
    let (_vm, mut sandbox) = sandbox("terminate");
    run(&mut sandbox, "raise \"boom\"");
    assert!(sandbox.error().is_some());

    sandbox.terminate();
    assert_eq!(sandbox.state(), TaskStatus::Terminated);
    assert_eq!(sandbox.result(), Value::Nil);
    assert_eq!(sandbox.error(), None);

    sandbox.terminate();
    assert_eq!(sandbox.state(), TaskStatus::Terminated);
}

#[test]
fn test_terminated_sandbox_cannot_run() {
    let (_vm, mut sandbox) = sandbox("dead");
    sandbox.terminate();

    assert!(matches!(sandbox.stop(), Err(Error::AlreadyStopped)));
    assert!(matches!(sandbox.execute(), Err(Error::Terminated)));
    assert!(matches!(sandbox.exec_bytecode(b""), Err(Error::Terminated)));

    // Compiling is still allowed; running is not.
    sandbox.compile("1", CompileOptions::default()).unwrap();
    assert!(matches!(sandbox.execute(), Err(Error::Terminated)));
    assert_eq!(sandbox.state(), TaskStatus::Terminated);
}
