//! Error types for sandbox operations.

use crate::bytecode::BytecodeError;
use crate::compiler::CompileError;
use crate::memory::MemoryError;
use crate::vm::TaskId;

/// Errors that can occur while driving a sandbox or the VM.
///
/// Failures inside a running script are not host errors: they become the
/// task's terminal value and are reported through
/// [`Sandbox::error`](crate::Sandbox::error).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Script text failed to compile.
    #[error("failed to compile script: {0}")]
    Compile(#[from] CompileError),

    /// A host-supplied argument was rejected before any resource was touched.
    #[error("invalid {field}: {value}")]
    InvalidArgument {
        /// Name of the offending argument.
        field: &'static str,
        /// The rejected value.
        value: i64,
    },

    /// A staged memory region could not be read.
    #[error("memory access failed: {0}")]
    Memory(#[from] MemoryError),

    /// A bytecode image could not be encoded or decoded.
    #[error("bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),

    /// No compiled program is available to bind to the task.
    #[error("no compiled program is available")]
    NoProgram,

    /// The task is not in a state that can be stopped.
    #[error("Already stopped")]
    AlreadyStopped,

    /// The task was terminated and can no longer be rebound or resumed.
    #[error("task has been terminated")]
    Terminated,

    /// A program was resolved against a compiler context that did not produce it.
    #[error("program belongs to compiler context {expected}, not {found}")]
    ContextMismatch {
        /// Context the program was compiled under.
        expected: u64,
        /// Context it was presented to.
        found: u64,
    },

    /// A program still refers to compiler-context symbols that were never resolved.
    #[error("program symbols are unresolved")]
    UnresolvedSymbols,

    /// The VM's task table is full.
    #[error("task limit reached ({max})")]
    TooManyTasks {
        /// Configured maximum number of live tasks.
        max: usize,
    },

    /// No live task is registered under the handle.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// The operation is reserved and not implemented.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
