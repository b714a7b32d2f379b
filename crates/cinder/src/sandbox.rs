//! Sandbox API for running scripts in an isolated task.

use std::time::{Duration, Instant};

use crate::compiler::{CompileOptions, CompilerOptions};
use crate::error::Error;
use crate::state::SandboxState;
use crate::value::{ScriptError, Value};
use crate::vm::{TaskId, TaskStatus, Vm};

const DEFAULT_NAME: &str = "sandbox";

/// A script sandbox bound to one task of a shared [`Vm`].
///
/// The sandbox owns a compiler context, at most one compiled program and a
/// task. Script failures never propagate as host errors: they end the task
/// in [`TaskStatus::Raised`] and are read back through [`error`](Self::error).
///
/// # Example
///
/// ```
/// use cinder::{CompileOptions, Sandbox, TaskStatus, Value, Vm};
///
/// # fn main() -> Result<(), cinder::Error> {
/// let vm = Vm::new();
/// let mut sandbox = Sandbox::builder().with_name("worker").build(&vm)?;
///
/// sandbox.compile("raise \"boom\"", CompileOptions::default())?;
/// sandbox.execute()?;
/// assert_eq!(sandbox.state(), TaskStatus::Raised);
/// assert_eq!(sandbox.error().map(|e| e.message), Some("boom".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    state: SandboxState,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("name", &self.state.name)
            .field("task", &self.state.task())
            .field("state", &self.state())
            .field("has_program", &self.has_program())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox named `"sandbox"` with default compiler options.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyTasks`] if the VM's task table is full.
    pub fn new(vm: &Vm) -> Result<Self, Error> {
        Self::builder().build(vm)
    }

    /// Create a builder for configuring a sandbox.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// Display name of the sandbox and its task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Handle of the sandbox's task in the VM.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.state.task()
    }

    /// The VM this sandbox runs on.
    #[must_use]
    pub fn vm(&self) -> &Vm {
        self.state.vm()
    }

    /// Compile `script`, replacing the current program.
    ///
    /// The new program runs on the next [`execute`](Self::execute). On
    /// failure the sandbox is left with no program.
    ///
    /// # Errors
    ///
    /// [`Error::Compile`] with the position of the problem.
    pub fn compile(&mut self, script: &str, options: CompileOptions) -> Result<(), Error> {
        self.state.compile(script.as_bytes(), options)
    }

    /// Compile `size` bytes of script text staged at `address` in the VM's
    /// [`MemoryMap`](crate::MemoryMap).
    ///
    /// Arguments are validated before anything is released, so a rejected
    /// call keeps the current program.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `size` or `address` is not positive,
    /// [`Error::Memory`] if the range is not staged, [`Error::Compile`] if
    /// the text does not compile.
    pub fn compile_from_memory(
        &mut self,
        address: i64,
        size: i64,
        options: CompileOptions,
    ) -> Result<(), Error> {
        if size <= 0 {
            return Err(Error::InvalidArgument {
                field: "size",
                value: size,
            });
        }
        if address <= 0 {
            return Err(Error::InvalidArgument {
                field: "address",
                value: address,
            });
        }
        let source = self
            .state
            .vm()
            .memory()
            .read(address.unsigned_abs(), size.unsigned_abs())?;
        self.state.compile(&source, options)
    }

    /// Run the current program from the start.
    ///
    /// Returns once the task suspends, finishes, raises or uses up one
    /// scheduler slice; in the last case it stays
    /// [`Running`](TaskStatus::Running) and continues on
    /// [`Vm::tick`].
    ///
    /// # Errors
    ///
    /// [`Error::NoProgram`] after a failed compile, [`Error::Terminated`]
    /// once the task has been terminated.
    pub fn execute(&mut self) -> Result<(), Error> {
        self.state.execute()
    }

    /// Run a pre-compiled bytecode image, bypassing the compiler.
    ///
    /// A malformed image is not a host error: the task raises `LoadError`.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] once the task has been terminated.
    pub fn exec_bytecode(&mut self, image: &[u8]) -> Result<(), Error> {
        self.state.exec_bytecode(image)
    }

    /// Run a bytecode image staged at `address`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if `address` is not positive,
    /// [`Error::Memory`] if nothing is staged there, [`Error::Terminated`]
    /// once the task has been terminated.
    pub fn exec_bytecode_from_memory(&mut self, address: i64) -> Result<(), Error> {
        if address <= 0 {
            return Err(Error::InvalidArgument {
                field: "address",
                value: address,
            });
        }
        let image = self
            .state
            .vm()
            .memory()
            .read_from(address.unsigned_abs())?;
        self.state.exec_bytecode(&image)
    }

    /// Current status of the task.
    #[must_use]
    pub fn state(&self) -> TaskStatus {
        self.state.status()
    }

    /// Terminal value of the task; `nil` until it finishes.
    ///
    /// If the task raised, this is the error value.
    #[must_use]
    pub fn result(&self) -> Value {
        self.state.value()
    }

    /// The error the task raised, if any.
    #[must_use]
    pub fn error(&self) -> Option<ScriptError> {
        match self.state.value() {
            Value::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Stop the task.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStopped`] if the task is stopped, finished, raised or
    /// terminated.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.state.stop()
    }

    /// Suspend the task if it is live.
    pub fn suspend(&mut self) {
        self.state.suspend();
    }

    /// Terminate the task. Terminating twice is a no-op.
    ///
    /// A terminated sandbox can no longer execute anything.
    pub fn terminate(&mut self) {
        self.state.terminate();
    }

    /// Reserved.
    ///
    /// # Errors
    ///
    /// Always [`Error::NotImplemented`].
    pub fn free_parser(&mut self) -> Result<(), Error> {
        Err(Error::NotImplemented("free_parser"))
    }

    /// Whether a compiled program is available to [`execute`](Self::execute).
    #[must_use]
    pub fn has_program(&self) -> bool {
        self.state.has_program()
    }

    /// Warnings from the most recent compile.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.state.options().warnings
    }

    /// Compiler options carried across recompilations.
    #[must_use]
    pub fn compiler_options(&self) -> &CompilerOptions {
        self.state.options()
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> &SandboxStats {
        &self.state.stats
    }

    /// Time since the last compile or execution, or since creation.
    #[must_use]
    pub fn idle_duration(&self) -> Duration {
        let stats = &self.state.stats;
        stats.last_activity.unwrap_or(stats.created_at).elapsed()
    }
}

/// Builder for [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    name: String,
    compiler_options: CompilerOptions,
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxBuilder {
    /// Create a builder with the default name and compiler options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            compiler_options: CompilerOptions::default(),
        }
    }

    /// Set the display name of the sandbox and its task.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the compiler options used for every compile.
    #[must_use]
    pub fn with_compiler_options(mut self, options: CompilerOptions) -> Self {
        self.compiler_options = options;
        self
    }

    /// Create the sandbox on `vm`.
    ///
    /// The task is bound to a placeholder program that suspends at once, so
    /// a new sandbox reports [`TaskStatus::Suspended`].
    ///
    /// # Errors
    ///
    /// [`Error::TooManyTasks`] if the VM's task table is full.
    pub fn build(self, vm: &Vm) -> Result<Sandbox, Error> {
        let state = SandboxState::new(vm, self.name, self.compiler_options)?;
        Ok(Sandbox { state })
    }
}

/// Activity counters for a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxStats {
    /// When the sandbox was created.
    pub created_at: Instant,

    /// When the last compile or execution happened (None if never).
    pub last_activity: Option<Instant>,

    /// Number of compiles attempted.
    pub compile_count: u64,

    /// Number of compiles that failed.
    pub failed_compile_count: u64,

    /// Number of executions started (`execute` and `exec_bytecode*`).
    pub execution_count: u64,

    /// Time spent inside execution calls.
    pub total_execution_time: Duration,
}

impl Default for SandboxStats {
    fn default() -> Self {
        Self {
            created_at: Instant::now(),
            last_activity: None,
            compile_count: 0,
            failed_compile_count: 0,
            execution_count: 0,
            total_execution_time: Duration::ZERO,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sandbox() -> (Vm, Sandbox) {
        let vm = Vm::new();
        let sandbox = Sandbox::builder().with_name("t1").build(&vm).expect("build");
        (vm, sandbox)
    }

    #[test]
    fn test_new_sandbox_is_suspended_on_placeholder() {
        let (vm, sandbox) = sandbox();
        assert_eq!(sandbox.name(), "t1");
        assert_eq!(sandbox.state(), TaskStatus::Suspended);
        assert!(sandbox.has_program());
        assert_eq!(sandbox.result(), Value::Nil);
        assert_eq!(vm.task_name(sandbox.task_id()).as_deref(), Some("t1"));
    }

    #[test]
    fn test_default_name() {
        let vm = Vm::new();
        let sandbox = Sandbox::new(&vm).expect("new");
        assert_eq!(sandbox.name(), "sandbox");
    }

    #[test]
    fn test_execute_placeholder_suspends_again() {
        let (_vm, mut sandbox) = sandbox();
        sandbox.execute().expect("execute");
        assert_eq!(sandbox.state(), TaskStatus::Suspended);
    }

    #[test]
    fn test_free_parser_is_not_implemented() {
        let (_vm, mut sandbox) = sandbox();
        assert!(matches!(
            sandbox.free_parser(),
            Err(Error::NotImplemented("free_parser"))
        ));
    }

    #[test]
    fn test_drop_releases_task() {
        let vm = Vm::new();
        let sandbox = Sandbox::new(&vm).expect("new");
        let id = sandbox.task_id();
        assert_eq!(vm.task_count(), 1);
        drop(sandbox);
        assert_eq!(vm.task_count(), 0);
        assert_eq!(vm.task_status(id), None);
    }

    #[test]
    fn test_stats_track_activity() {
        let (_vm, mut sandbox) = sandbox();
        sandbox.compile("1 +", CompileOptions::default()).expect_err("should fail");
        sandbox.compile("1", CompileOptions::default()).expect("compile");
        sandbox.execute().expect("execute");
        let stats = sandbox.stats();
        assert_eq!(stats.compile_count, 2);
        assert_eq!(stats.failed_compile_count, 1);
        assert_eq!(stats.execution_count, 1);
        assert!(stats.last_activity.is_some());
    }
}
