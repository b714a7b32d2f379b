//! Tasks and their execution state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::program::Program;
use crate::value::Value;

/// Handle to a task slot in a [`Vm`](super::Vm).
///
/// The generation changes every time a slot is released, so a stale handle
/// never refers to a newer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Bound to a program with a fresh context, not yet run.
    Ready,
    /// Runnable; a preempted task stays here until its next slice.
    Running,
    /// Parked until resumed.
    Suspended,
    /// Stopped by the host; can be rebound and run again.
    Stopped,
    /// Terminated; cannot be rebound.
    Terminated,
    /// Ran to completion.
    Finished,
    /// Ended with an uncaught script error.
    Raised,
}

impl TaskStatus {
    /// Whether the task can still make progress without being reset.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Suspended)
    }

    /// Lowercase name, as shown to users.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Finished => "finished",
            Self::Raised => "raised",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Scheduler slices the task has run.
    pub slices: u64,
    /// Instructions executed across all slices.
    pub instructions: u64,
}

/// Snapshot of a task, as listed by [`Vm::tasks`](super::Vm::tasks).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    /// Task handle.
    pub id: TaskId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
    /// Parent task, `None` for children of the root context.
    pub parent: Option<TaskId>,
    /// Execution counters.
    pub stats: TaskStats,
}

/// An executable closure over a resolved program.
#[derive(Debug, Clone)]
pub struct Proc {
    program: Arc<Program>,
}

impl Proc {
    /// Wrap a program.
    ///
    /// # Errors
    ///
    /// [`Error::UnresolvedSymbols`] if the program's symbols have not been
    /// resolved against its compiler context.
    pub fn new(program: Arc<Program>) -> Result<Self, Error> {
        if !program.is_resolved() {
            return Err(Error::UnresolvedSymbols);
        }
        Ok(Self { program })
    }

    /// The program this closure runs.
    #[must_use]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }
}

/// Program counter, operand stack and locals of a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExecContext {
    pub pc: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
}

impl ExecContext {
    pub(crate) fn new(nlocals: u16) -> Self {
        Self {
            pc: 0,
            stack: Vec::new(),
            locals: vec![Value::Nil; usize::from(nlocals)],
        }
    }

    /// Rewind to the start of a program, keeping allocations.
    pub(crate) fn reset(&mut self, nlocals: u16) {
        self.pc = 0;
        self.stack.clear();
        self.locals.clear();
        self.locals.resize(usize::from(nlocals), Value::Nil);
    }
}

#[derive(Debug)]
pub(crate) struct Task {
    pub name: String,
    pub parent: Option<TaskId>,
    pub status: TaskStatus,
    pub proc: Proc,
    pub context: Option<ExecContext>,
    pub value: Value,
    pub stats: TaskStats,
    /// Whether an entry for this task sits in the run queue.
    pub queued: bool,
}

impl Task {
    pub(crate) fn new(name: String, proc: Proc, parent: Option<TaskId>) -> Self {
        let context = ExecContext::new(proc.program().nlocals());
        Self {
            name,
            parent,
            status: TaskStatus::Ready,
            proc,
            context: Some(context),
            value: Value::Nil,
            stats: TaskStats::default(),
            queued: false,
        }
    }

    pub(crate) fn info(&self, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            name: self.name.clone(),
            status: self.status,
            parent: self.parent,
            stats: self.stats,
        }
    }
}
