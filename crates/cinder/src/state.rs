//! The record behind a [`Sandbox`](crate::Sandbox).

use std::sync::Arc;
use std::time::Instant;

use crate::bytecode;
use crate::compiler::{CompileOptions, CompilerContext, CompilerOptions};
use crate::error::Error;
use crate::program::Program;
use crate::sandbox::SandboxStats;
use crate::value::{ScriptError, Value};
use crate::vm::{Proc, TaskId, TaskStatus, Vm};

/// Bound at construction so the task always has a program to run.
const PLACEHOLDER: &str = "Task.current.suspend";

/// One compiler context, at most one program and exactly one task.
///
/// The program is always dropped before (or together with) the context that
/// compiled it. The task is created once and released on drop.
pub(crate) struct SandboxState {
    pub(crate) name: String,
    pub(crate) stats: SandboxStats,
    vm: Vm,
    context: Option<CompilerContext>,
    program: Option<Arc<Program>>,
    options: CompilerOptions,
    task: TaskId,
}

impl SandboxState {
    pub(crate) fn new(vm: &Vm, name: String, options: CompilerOptions) -> Result<Self, Error> {
        let mut context = CompilerContext::new(options);
        let mut placeholder = context.load(PLACEHOLDER.as_bytes())?;
        context.resolve_symbols(&mut placeholder)?;
        let program = Arc::new(placeholder);

        let task = vm.create_task(&name, Proc::new(Arc::clone(&program))?, None)?;
        // Let the placeholder reach its suspend point.
        if let Err(err) = vm.start(task) {
            vm.release(task);
            return Err(err);
        }
        tracing::debug!(sandbox = %name, task = %task, "sandbox created");

        Ok(Self {
            name,
            stats: SandboxStats::default(),
            vm: vm.clone(),
            options: context.options().clone(),
            context: Some(context),
            program: Some(program),
            task,
        })
    }

    pub(crate) fn task(&self) -> TaskId {
        self.task
    }

    pub(crate) fn has_program(&self) -> bool {
        self.program.is_some()
    }

    pub(crate) fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub(crate) fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Replace the program with one compiled from `source`.
    ///
    /// The old program and context are dropped first, so a failed compile
    /// leaves no program behind.
    pub(crate) fn compile(&mut self, source: &[u8], options: CompileOptions) -> Result<(), Error> {
        self.program = None;
        self.context = None;

        let mut context = CompilerContext::new(self.options.clone());
        let result = context.load(source);
        self.options = context.options().clone();
        self.stats.compile_count += 1;
        self.stats.last_activity = Some(Instant::now());

        match result {
            Ok(mut program) => {
                if options.strip_locals {
                    context.strip_locals(&mut program);
                }
                tracing::debug!(
                    sandbox = %self.name,
                    ops = program.code().len(),
                    strip_locals = options.strip_locals,
                    "script compiled"
                );
                self.program = Some(Arc::new(program));
                self.context = Some(context);
                Ok(())
            }
            Err(err) => {
                self.stats.failed_compile_count += 1;
                tracing::debug!(sandbox = %self.name, error = %err, "script failed to compile");
                Err(err.into())
            }
        }
    }

    /// Bind the current program to the task and run it from the start.
    pub(crate) fn execute(&mut self) -> Result<(), Error> {
        if self.status() == TaskStatus::Terminated {
            return Err(Error::Terminated);
        }
        let Some(program) = self.program.as_mut() else {
            return Err(Error::NoProgram);
        };
        if !program.is_resolved() {
            let context = self.context.as_ref().ok_or(Error::UnresolvedSymbols)?;
            // The task may still hold this program; resolve a private copy then.
            context.resolve_symbols(Arc::make_mut(program))?;
        }
        let proc = Proc::new(Arc::clone(program))?;

        let started = Instant::now();
        self.vm.set_proc(self.task, proc)?;
        self.vm.reset_context(self.task)?;
        self.vm.resume(self.task)?;
        self.record_execution(started);
        Ok(())
    }

    /// Decode `image` and run it in a freshly initialized context.
    ///
    /// A malformed image becomes a program that raises `LoadError`.
    pub(crate) fn exec_bytecode(&mut self, image: &[u8]) -> Result<(), Error> {
        if self.status() == TaskStatus::Terminated {
            return Err(Error::Terminated);
        }
        self.program = None;

        let program = bytecode::decode(image).unwrap_or_else(|err| {
            tracing::warn!(sandbox = %self.name, error = %err, "rejected bytecode image");
            Program::raising(ScriptError::new("LoadError", err.to_string()))
        });
        let program = Arc::new(program);
        self.program = Some(Arc::clone(&program));

        let started = Instant::now();
        self.vm.set_proc(self.task, Proc::new(program)?)?;
        self.vm.init_context(self.task)?;
        self.vm.resume(self.task)?;
        self.record_execution(started);
        Ok(())
    }

    fn record_execution(&mut self, started: Instant) {
        let now = Instant::now();
        self.stats.execution_count += 1;
        self.stats.total_execution_time += now.duration_since(started);
        self.stats.last_activity = Some(now);
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.vm
            .task_status(self.task)
            .unwrap_or(TaskStatus::Terminated)
    }

    pub(crate) fn value(&self) -> Value {
        self.vm.task_value(self.task).unwrap_or_default()
    }

    pub(crate) fn stop(&mut self) -> Result<(), Error> {
        if self.vm.stop(self.task)? {
            Ok(())
        } else {
            Err(Error::AlreadyStopped)
        }
    }

    pub(crate) fn suspend(&mut self) {
        if let Err(err) = self.vm.suspend(self.task) {
            tracing::warn!(sandbox = %self.name, error = %err, "suspend failed");
        }
    }

    pub(crate) fn terminate(&mut self) {
        if let Err(err) = self.vm.terminate(self.task) {
            tracing::warn!(sandbox = %self.name, error = %err, "terminate failed");
        }
    }
}

impl Drop for SandboxState {
    fn drop(&mut self) {
        self.program = None;
        self.context = None;
        self.terminate();
        self.vm.release(self.task);
        tracing::debug!(sandbox = %self.name, "sandbox dropped");
    }
}
