//! # Cinder
//!
//! An embedded scripting sandbox: compile untrusted script text (or
//! pre-compiled bytecode) into an isolated, cooperatively scheduled task and
//! drive that task's lifecycle without letting the script halt or corrupt the
//! host.
//!
//! - **Sandboxes** own a compiler context, a compiled program and exactly one
//!   task on a shared [`Vm`].
//! - **Safe recompilation** - replacing a program always releases the previous
//!   one first; a failed compile leaves no stale program behind.
//! - **Bytecode injection** - pre-compiled images skip the compiler entirely.
//! - **Cooperative scheduling** - scripts yield with `suspend`, long-running
//!   scripts are sliced by an instruction budget, and a process-wide
//!   [`Interrupt`] flag is delivered at slice boundaries.
//!
//! ## Quick Start
//!
//! ```rust
//! use cinder::{CompileOptions, Sandbox, TaskStatus, Value, Vm};
//!
//! fn main() -> Result<(), cinder::Error> {
//!     let vm = Vm::new();
//!     let mut sandbox = Sandbox::builder().with_name("t1").build(&vm)?;
//!     assert_eq!(sandbox.state(), TaskStatus::Suspended);
//!
//!     sandbox.compile("40 + 2", CompileOptions::default())?;
//!     sandbox.execute()?;
//!
//!     assert_eq!(sandbox.state(), TaskStatus::Finished);
//!     assert_eq!(sandbox.result(), Value::Int(42));
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod bytecode;
pub mod compiler;
mod error;
pub mod memory;
mod program;
mod sandbox;
mod state;
mod value;
pub mod vm;

pub use bytecode::BytecodeError;
pub use compiler::{CompileError, CompileOptions, CompilerContext, CompilerOptions};
pub use error::Error;
pub use memory::{MemoryError, MemoryMap};
pub use program::{Constant, Op, Program};
pub use sandbox::{Sandbox, SandboxBuilder, SandboxStats};
pub use value::{ScriptError, Value};
pub use vm::{Interrupt, Proc, TaskId, TaskInfo, TaskStats, TaskStatus, Vm, VmConfig};
