//! CLI tool for running cinder scripts in a sandbox.
//!
//! Accepts either script source or a bytecode image produced by
//! `cinder-precompile`; images are recognised by their magic bytes.
//!
//! # Examples
//!
//! ```bash
//! cinder-run job.rb
//! cinder-run job.cbc --name worker --json
//! cinder-run job.rb --config vm.json -v
//! ```
//!
//! Ctrl-C raises `Interrupt` inside the running script. A second Ctrl-C
//! before the first is delivered exits immediately.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use cinder::{CompileOptions, Sandbox, TaskStatus, Value, Vm, VmConfig, bytecode};

/// Run a cinder script or bytecode image in a sandbox.
#[derive(Parser, Debug)]
#[command(name = "cinder-run")]
#[command(version, about, long_about = None)]
struct Args {
    /// Script source or bytecode image
    #[arg(required = true)]
    input: PathBuf,

    /// Name of the sandbox task
    #[arg(long, default_value = "R2P2")]
    name: String,

    /// VM configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// What the host saw once the VM went idle.
#[derive(Debug)]
struct Outcome {
    status: TaskStatus,
    value: Value,
    ticks: usize,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose {
        "cinder=debug,cinder_run=debug"
    } else {
        "cinder=warn,cinder_run=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => VmConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => VmConfig::default(),
    };
    let input = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read input file: {}", args.input.display()))?;

    let vm = Vm::with_config(config);

    let interrupt = vm.interrupt().clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.signal() {
                tracing::warn!("interrupt not delivered, exiting");
                std::process::exit(130);
            }
            tracing::info!("interrupt requested");
        }
    });

    let start = Instant::now();
    let name = args.name.clone();
    let filename = display_name(&args.input);
    let outcome = tokio::task::spawn_blocking(move || run(&vm, &name, &filename, &input))
        .await
        .context("Sandbox thread panicked")??;
    tracing::debug!(elapsed = ?start.elapsed(), ticks = outcome.ticks, "run finished");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&outcome))?);
    } else {
        match outcome.value.as_error() {
            Some(error) => eprintln!("{}: {} ({})", args.name, error.message, error.class),
            None => println!("{}", outcome.value.inspect()),
        }
        if outcome.status == TaskStatus::Suspended {
            eprintln!("{}: task is suspended", args.name);
        }
    }

    Ok(if outcome.status == TaskStatus::Raised {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Load `input` into a new sandbox and drive the VM until nothing is runnable.
fn run(vm: &Vm, name: &str, filename: &str, input: &[u8]) -> Result<Outcome> {
    let mut sandbox = Sandbox::builder()
        .with_name(name)
        .with_compiler_options(cinder::CompilerOptions::default().with_filename(filename))
        .build(vm)
        .context("Failed to create sandbox")?;

    if input.starts_with(&bytecode::MAGIC) {
        tracing::debug!(bytes = input.len(), "running bytecode image");
        sandbox.exec_bytecode(input)?;
    } else {
        let source = std::str::from_utf8(input).context("Script is not valid UTF-8")?;
        sandbox.compile(source, CompileOptions::default())?;
        for warning in sandbox.warnings() {
            tracing::warn!(%warning, "compiler warning");
        }
        sandbox.execute()?;
    }

    let ticks = vm.run_until_idle();
    Ok(Outcome {
        status: sandbox.state(),
        value: sandbox.result(),
        ticks,
    })
}

fn to_json(outcome: &Outcome) -> serde_json::Value {
    serde_json::json!({
        "status": outcome.status,
        "value": outcome.value,
        "error": outcome.value.as_error(),
        "ticks": outcome.ticks,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn image(source: &str) -> Vec<u8> {
        let mut context = cinder::CompilerContext::new(cinder::CompilerOptions::default());
        let mut program = context.load(source.as_bytes()).unwrap();
        context.resolve_symbols(&mut program).unwrap();
        bytecode::encode(&program).unwrap()
    }

    #[test]
    fn test_run_source() {
        let vm = Vm::new();
        let outcome = run(&vm, "t", "a.rb", b"6 * 7").unwrap();
        assert_eq!(outcome.status, TaskStatus::Finished);
        assert_eq!(outcome.value, Value::Int(42));
    }

    #[test]
    fn test_run_detects_bytecode() {
        let vm = Vm::new();
        let outcome = run(&vm, "t", "a.cbc", &image("\"hi\"")).unwrap();
        assert_eq!(outcome.value, Value::from("hi"));
    }

    #[test]
    fn test_run_drives_sliced_script_to_completion() {
        let vm = Vm::with_config(VmConfig {
            slice_budget: 100,
            ..VmConfig::default()
        });
        let outcome = run(&vm, "t", "a.rb", b"i = 0\nwhile i < 1000\n  i = i + 1\nend\ni").unwrap();
        assert_eq!(outcome.status, TaskStatus::Finished);
        assert_eq!(outcome.value, Value::Int(1000));
        assert!(outcome.ticks > 0);
    }

    #[test]
    fn test_compile_error_is_a_host_error() {
        let vm = Vm::new();
        let err = run(&vm, "t", "bad.rb", b"1 +").unwrap_err();
        assert!(err.to_string().contains("bad.rb:1:"), "{err}");
    }

    #[test]
    fn test_raised_outcome_json() {
        let vm = Vm::new();
        let outcome = run(&vm, "t", "a.rb", b"raise \"boom\"").unwrap();
        let json = to_json(&outcome);
        assert_eq!(json["status"], "raised");
        assert_eq!(json["error"]["class"], "RuntimeError");
        assert_eq!(json["error"]["message"], "boom");
    }

    #[test]
    fn test_config_file_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        std::fs::write(&path, r#"{"max_string_len": 4}"#).unwrap();

        let vm = Vm::with_config(VmConfig::from_file(&path).unwrap());
        let outcome = run(&vm, "t", "a.rb", b"\"abc\" * 2").unwrap();
        assert_eq!(outcome.status, TaskStatus::Raised);
    }
}
