//! Task arena and run queue.

use std::collections::VecDeque;
use std::sync::Arc;

use super::interp::{self, Limits, SliceOutcome};
use super::interrupt::Interrupt;
use super::task::{ExecContext, Proc, Task, TaskId, TaskInfo, TaskStatus};
use crate::error::Error;
use crate::value::Value;

struct Slot {
    generation: u32,
    task: Option<Task>,
}

/// Generation-checked task arena with a FIFO run queue.
pub(crate) struct Scheduler {
    slots: Vec<Slot>,
    free: Vec<u32>,
    run_queue: VecDeque<TaskId>,
    live: usize,
    max_tasks: usize,
}

impl Scheduler {
    pub(crate) fn new(max_tasks: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            run_queue: VecDeque::new(),
            live: 0,
            max_tasks,
        }
    }

    pub(crate) fn insert(&mut self, task: Task) -> Result<TaskId, Error> {
        if self.live >= self.max_tasks {
            return Err(Error::TooManyTasks {
                max: self.max_tasks,
            });
        }
        let id = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.task = Some(task);
            TaskId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).map_err(|_| Error::TooManyTasks {
                max: self.max_tasks,
            })?;
            self.slots.push(Slot {
                generation: 0,
                task: Some(task),
            });
            TaskId {
                index,
                generation: 0,
            }
        };
        self.live += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.task.as_ref())
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut Task, Error> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.task.as_mut())
            .ok_or(Error::TaskNotFound(id))
    }

    /// A task that may still be rebound; terminated tasks may not.
    fn rebindable(&mut self, id: TaskId) -> Result<&mut Task, Error> {
        let task = self.get_mut(id)?;
        if task.status == TaskStatus::Terminated {
            return Err(Error::Terminated);
        }
        Ok(task)
    }

    pub(crate) fn release(&mut self, id: TaskId) -> bool {
        let Some(slot) = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.task.is_some())
        else {
            return false;
        };
        slot.task = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        true
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn set_proc(&mut self, id: TaskId, proc: Proc) -> Result<(), Error> {
        self.rebindable(id)?.proc = proc;
        Ok(())
    }

    pub(crate) fn init_context(&mut self, id: TaskId) -> Result<(), Error> {
        let task = self.rebindable(id)?;
        task.context = Some(ExecContext::new(task.proc.program().nlocals()));
        task.status = TaskStatus::Ready;
        task.value = Value::Nil;
        Ok(())
    }

    pub(crate) fn reset_context(&mut self, id: TaskId) -> Result<(), Error> {
        let task = self.rebindable(id)?;
        let nlocals = task.proc.program().nlocals();
        task.context
            .get_or_insert_with(ExecContext::default)
            .reset(nlocals);
        task.status = TaskStatus::Ready;
        task.value = Value::Nil;
        Ok(())
    }

    pub(crate) fn resume(&mut self, id: TaskId, limits: Limits, interrupt: &Interrupt) -> Result<(), Error> {
        let task = self.get_mut(id)?;
        match task.status {
            TaskStatus::Terminated => Err(Error::Terminated),
            TaskStatus::Stopped | TaskStatus::Finished | TaskStatus::Raised => Ok(()),
            TaskStatus::Ready | TaskStatus::Suspended | TaskStatus::Running => {
                task.status = TaskStatus::Running;
                tracing::trace!(task = %id, name = %task.name, "resuming task");
                self.run_slice(id, limits, interrupt);
                Ok(())
            }
        }
    }

    pub(crate) fn suspend(&mut self, id: TaskId) -> Result<(), Error> {
        let task = self.get_mut(id)?;
        if matches!(task.status, TaskStatus::Running | TaskStatus::Ready) {
            task.status = TaskStatus::Suspended;
        }
        Ok(())
    }

    pub(crate) fn stop(&mut self, id: TaskId) -> Result<bool, Error> {
        let task = self.get_mut(id)?;
        if !task.status.is_live() {
            return Ok(false);
        }
        task.status = TaskStatus::Stopped;
        task.value = Value::Nil;
        tracing::debug!(task = %id, name = %task.name, "task stopped");
        Ok(true)
    }

    pub(crate) fn terminate(&mut self, id: TaskId) -> Result<(), Error> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Terminated {
            tracing::debug!(task = %id, name = %task.name, "task terminated");
        }
        task.status = TaskStatus::Terminated;
        task.context = None;
        task.value = Value::Nil;
        Ok(())
    }

    /// Run one slice of every task that was runnable when the tick began.
    pub(crate) fn tick(&mut self, limits: Limits, interrupt: &Interrupt) -> usize {
        let batch: Vec<TaskId> = self.run_queue.drain(..).collect();
        let mut ran = 0;
        for id in batch {
            let Ok(task) = self.get_mut(id) else {
                continue;
            };
            task.queued = false;
            if task.status == TaskStatus::Running {
                self.run_slice(id, limits, interrupt);
                ran += 1;
            }
        }
        ran
    }

    pub(crate) fn has_runnable(&self) -> bool {
        self.run_queue
            .iter()
            .any(|&id| self.get(id).is_some_and(|task| task.status == TaskStatus::Running))
    }

    pub(crate) fn tasks(&self) -> Vec<TaskInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let id = TaskId {
                    index: index as u32,
                    generation: slot.generation,
                };
                slot.task.as_ref().map(|task| task.info(id))
            })
            .collect()
    }

    fn run_slice(&mut self, id: TaskId, limits: Limits, interrupt: &Interrupt) {
        let Ok(task) = self.get_mut(id) else {
            return;
        };
        let program = Arc::clone(task.proc.program());
        let context = task
            .context
            .get_or_insert_with(|| ExecContext::new(program.nlocals()));
        let slice = interp::run(&program, context, limits, interrupt);

        task.stats.slices += 1;
        task.stats.instructions += slice.executed;
        let requeue = match slice.outcome {
            SliceOutcome::Suspended => {
                task.status = TaskStatus::Suspended;
                false
            }
            SliceOutcome::Finished(value) => {
                tracing::debug!(task = %id, name = %task.name, "task finished");
                task.status = TaskStatus::Finished;
                task.value = value;
                false
            }
            SliceOutcome::Raised(err) => {
                tracing::debug!(task = %id, name = %task.name, error = %err, "task raised");
                task.status = TaskStatus::Raised;
                task.value = Value::Error(err);
                false
            }
            SliceOutcome::Preempted => {
                let requeue = !task.queued;
                task.queued = true;
                requeue
            }
        };
        if requeue {
            self.run_queue.push_back(id);
        }
    }
}
