//! CLI tool for pre-compiling cinder scripts.
//!
//! This tool compiles a script to a bytecode image once, so sandboxes can
//! load it with `exec_bytecode` and skip the compiler entirely.
//!
//! # Examples
//!
//! ```bash
//! # Compile to job.cbc next to the source
//! cinder-precompile job.rb
//!
//! # Drop local variable names from the image
//! cinder-precompile job.rb -o job.cbc --strip-locals
//!
//! # Skip loading the image back into a sandbox
//! cinder-precompile job.rb --no-verify
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use cinder::{CompilerContext, CompilerOptions, Sandbox, Vm, bytecode};

/// Pre-compile cinder scripts to bytecode images.
#[derive(Parser, Debug)]
#[command(name = "cinder-precompile")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input script file
    #[arg(required = true)]
    input: PathBuf,

    /// Output path (default: input with .cbc extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Drop local variable names from the image
    #[arg(long)]
    strip_locals: bool,

    /// Skip verification step
    #[arg(long)]
    no_verify: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "cinder=debug,cinder_precompile=debug"
    } else {
        "cinder=warn,cinder_precompile=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));

    println!("cinder-precompile");
    println!("=================");
    println!();
    println!("Input:   {}", args.input.display());
    println!("Output:  {}", output.display());
    println!();

    let source = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read input file: {}", args.input.display()))?;
    println!("Input size: {} bytes", source.len());

    println!();
    println!("Step 1: Compiling...");
    let start = Instant::now();
    let image = compile(&args.input, &source, args.strip_locals)?;
    println!("  Done in {:?} ({} bytes)", start.elapsed(), image.len());

    println!();
    println!("Step 2: Writing output...");
    std::fs::write(&output, &image)
        .with_context(|| format!("Failed to write output: {}", output.display()))?;
    let digest = bytecode::digest_hex(&image).context("Failed to read image digest")?;
    println!("  Saved to: {}", output.display());
    println!("  SHA-256:  {digest}");

    if !args.no_verify {
        println!();
        println!("Step 3: Verifying...");
        verify(&image)?;
        println!("  Verification passed!");
    }

    println!();
    println!("Success!");
    Ok(())
}

fn default_output(input: &Path) -> PathBuf {
    let mut out = input.to_path_buf();
    out.set_extension("cbc");
    out
}

/// Compile `source` and encode it as a bytecode image.
fn compile(input: &Path, source: &[u8], strip_locals: bool) -> Result<Vec<u8>> {
    let filename = input
        .file_name()
        .map_or_else(|| input.display().to_string(), |n| n.to_string_lossy().into_owned());
    let mut context = CompilerContext::new(CompilerOptions::default().with_filename(filename));

    let mut program = context.load(source).context("Failed to compile script")?;
    for warning in &context.options().warnings {
        tracing::warn!(%warning, "compiler warning");
    }
    if strip_locals {
        context.strip_locals(&mut program);
    }
    context
        .resolve_symbols(&mut program)
        .context("Failed to resolve program symbols")?;

    tracing::debug!(
        ops = program.code().len(),
        constants = program.constants().len(),
        "program compiled"
    );
    bytecode::encode(&program).context("Failed to encode bytecode image")
}

/// Load the image into a fresh sandbox and run its first slice.
fn verify(image: &[u8]) -> Result<()> {
    let vm = Vm::new();
    let mut sandbox = Sandbox::builder()
        .with_name("cinder-precompile")
        .build(&vm)
        .context("Failed to create sandbox")?;
    sandbox
        .exec_bytecode(image)
        .context("Failed to run bytecode image")?;

    if let Some(error) = sandbox.error()
        && error.is_a("LoadError")
    {
        anyhow::bail!("Verification failed: {}", error.message);
    }
    println!("  Task state after first slice: {}", sandbox.state());
    sandbox.terminate();
    Ok(())
}
