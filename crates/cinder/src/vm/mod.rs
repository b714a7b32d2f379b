//! The shared cooperative VM.
//!
//! A [`Vm`] owns every task, the staged [`MemoryMap`] and the process-wide
//! [`Interrupt`] flag. Handles are cheap to clone; all of them drive the same
//! scheduler.
//!
//! ```
//! use cinder::{Sandbox, TaskStatus, Vm, VmConfig};
//!
//! # fn main() -> Result<(), cinder::Error> {
//! let vm = Vm::with_config(VmConfig {
//!     slice_budget: 1_000,
//!     ..VmConfig::default()
//! });
//! let mut sandbox = Sandbox::new(&vm)?;
//! sandbox.compile("i = 0\nwhile i < 10_000\n  i = i + 1\nend\ni", Default::default())?;
//! sandbox.execute()?;
//! assert_eq!(sandbox.state(), TaskStatus::Running);
//!
//! vm.run_until_idle();
//! assert_eq!(sandbox.state(), TaskStatus::Finished);
//! # Ok(())
//! # }
//! ```

mod interp;
mod interrupt;
mod scheduler;
mod task;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use self::interp::Limits;
use self::scheduler::Scheduler;
use crate::error::Error;
use crate::memory::MemoryMap;
use crate::value::Value;

pub use self::interrupt::Interrupt;
pub use self::task::{Proc, TaskId, TaskInfo, TaskStats, TaskStatus};

/// VM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions a task may run per scheduler slice.
    pub slice_budget: u64,
    /// Maximum operand stack depth per task.
    pub max_stack_depth: usize,
    /// Maximum number of live tasks.
    pub max_tasks: usize,
    /// Maximum length of a string built by a script, in bytes.
    pub max_string_len: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            slice_budget: 10_000,
            max_stack_depth: 1024,
            max_tasks: 64,
            max_string_len: 1024 * 1024, // 1 MiB
        }
    }
}

impl VmConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] on malformed JSON, [`Error::Config`] if a
    /// value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check that every limit is usable.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the first zero limit.
    pub fn validate(&self) -> Result<(), Error> {
        let zero = [
            ("slice_budget", self.slice_budget == 0),
            ("max_stack_depth", self.max_stack_depth == 0),
            ("max_tasks", self.max_tasks == 0),
        ]
        .into_iter()
        .find_map(|(field, is_zero)| is_zero.then_some(field));
        match zero {
            Some(field) => Err(Error::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            budget: self.slice_budget,
            max_stack_depth: self.max_stack_depth,
            max_string_len: self.max_string_len,
        }
    }
}

/// Handle to a shared VM.
#[derive(Clone)]
pub struct Vm {
    scheduler: Arc<Mutex<Scheduler>>,
    memory: MemoryMap,
    interrupt: Interrupt,
    config: Arc<VmConfig>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// Create a VM with the given configuration.
    #[must_use]
    pub fn with_config(config: VmConfig) -> Self {
        tracing::debug!(
            slice_budget = config.slice_budget,
            max_tasks = config.max_tasks,
            "creating VM"
        );
        Self {
            scheduler: Arc::new(Mutex::new(Scheduler::new(config.max_tasks))),
            memory: MemoryMap::new(),
            interrupt: Interrupt::new(),
            config: Arc::new(config),
        }
    }

    /// The VM's configuration.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The staged memory map read by the `*_from_memory` operations.
    #[must_use]
    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// The interrupt flag polled by the scheduler.
    #[must_use]
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    fn lock(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task running `proc`. The task starts `Ready`.
    ///
    /// `parent` is `None` for tasks owned by the root context.
    ///
    /// # Errors
    ///
    /// [`Error::TooManyTasks`] if the task table is full.
    pub fn create_task(&self, name: &str, proc: Proc, parent: Option<TaskId>) -> Result<TaskId, Error> {
        let id = self
            .lock()
            .insert(task::Task::new(name.to_string(), proc, parent))?;
        tracing::debug!(task = %id, name, "task created");
        Ok(id)
    }

    /// Status of a task, or `None` if the handle is stale.
    #[must_use]
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.lock().get(id).map(|task| task.status)
    }

    /// Terminal value of a task (`nil` until it finishes or raises).
    #[must_use]
    pub fn task_value(&self, id: TaskId) -> Option<Value> {
        self.lock().get(id).map(|task| task.value.clone())
    }

    /// Display name of a task.
    #[must_use]
    pub fn task_name(&self, id: TaskId) -> Option<String> {
        self.lock().get(id).map(|task| task.name.clone())
    }

    /// Execution counters of a task.
    #[must_use]
    pub fn task_stats(&self, id: TaskId) -> Option<TaskStats> {
        self.lock().get(id).map(|task| task.stats)
    }

    /// Replace a task's entry point. Takes effect at the next context reset.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] or [`Error::TaskNotFound`].
    pub fn set_proc(&self, id: TaskId, proc: Proc) -> Result<(), Error> {
        self.lock().set_proc(id, proc)
    }

    /// Give a task a freshly allocated execution context at the start of its
    /// program. The task becomes `Ready`.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] or [`Error::TaskNotFound`].
    pub fn init_context(&self, id: TaskId) -> Result<(), Error> {
        self.lock().init_context(id)
    }

    /// Rewind a task's existing execution context to the start of its
    /// program. The task becomes `Ready`.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] or [`Error::TaskNotFound`].
    pub fn reset_context(&self, id: TaskId) -> Result<(), Error> {
        self.lock().reset_context(id)
    }

    /// Run a task for one slice.
    ///
    /// Finished, raised and stopped tasks are left alone. A task that uses up
    /// its slice stays `Running` and continues on the next [`tick`](Self::tick).
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] or [`Error::TaskNotFound`].
    pub fn resume(&self, id: TaskId) -> Result<(), Error> {
        self.lock().resume(id, self.config.limits(), &self.interrupt)
    }

    /// Run a task's first slice without polling the interrupt flag.
    ///
    /// Used when the host binds a task itself, so a pending interrupt stays
    /// pending for the script it was meant for.
    pub(crate) fn start(&self, id: TaskId) -> Result<(), Error> {
        self.lock().resume(id, self.config.limits(), &Interrupt::new())
    }

    /// Park a running or ready task. No effect on other states.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`].
    pub fn suspend(&self, id: TaskId) -> Result<(), Error> {
        self.lock().suspend(id)
    }

    /// Stop a live task. Returns `false` if it was not live.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`].
    pub fn stop(&self, id: TaskId) -> Result<bool, Error> {
        self.lock().stop(id)
    }

    /// Terminate a task, dropping its execution context and value.
    ///
    /// # Errors
    ///
    /// [`Error::TaskNotFound`].
    pub fn terminate(&self, id: TaskId) -> Result<(), Error> {
        self.lock().terminate(id)
    }

    /// Free a task slot. Returns `false` if the handle was already stale.
    pub fn release(&self, id: TaskId) -> bool {
        let released = self.lock().release(id);
        if released {
            tracing::debug!(task = %id, "task released");
        }
        released
    }

    /// Run one slice of every runnable task, in FIFO order.
    ///
    /// Returns the number of slices run.
    pub fn tick(&self) -> usize {
        self.lock().tick(self.config.limits(), &self.interrupt)
    }

    /// Tick until no task is runnable. Returns the number of ticks.
    pub fn run_until_idle(&self) -> usize {
        let mut ticks = 0;
        while self.lock().has_runnable() {
            self.tick();
            ticks += 1;
        }
        ticks
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.lock().live()
    }

    /// Snapshot of every registered task.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.lock().tasks()
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("config", &self.config)
            .field("tasks", &self.task_count())
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config = VmConfig::from_json_str(r#"{"slice_budget": 500}"#).expect("parse");
        assert_eq!(config.slice_budget, 500);
        assert_eq!(config.max_tasks, VmConfig::default().max_tasks);
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let err = VmConfig::from_json_str(r#"{"max_tasks": 0}"#).expect_err("should fail");
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("max_tasks")));

        let err = VmConfig::from_json_str("{not json").expect_err("should fail");
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_clones_share_scheduler() {
        let vm = Vm::new();
        let other = vm.clone();
        assert_eq!(other.task_count(), 0);
        other.interrupt().signal();
        assert!(vm.interrupt().is_pending());
    }
}
