// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-invocation context handed to action bodies.

use crate::error::Error;
use crate::task::{Task, TaskState};
use core::fmt;
use std::thread::ThreadId;

/// Everything an action body receives for one instance invocation.
pub struct ActionInput<'a> {
    /// The task's argument bytes.
    pub args: &'a [u8],
    /// Writer over the task's result buffer.
    pub result: &'a ResultBuffer,
    /// The node-local data registered with the action.
    pub node_local: &'a [u8],
    /// Instance/task introspection and status recording.
    pub ctx: &'a TaskContext<'a>,
}

/// Write access to a task's result buffer.
///
/// All instances of a task share one buffer; the action contract is that each
/// instance writes a disjoint range (typically `instance * chunk ..`).
pub struct ResultBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ResultBuffer {
    pub(crate) fn new(ptr: *mut u8, len: usize) -> ResultBuffer {
        ResultBuffer { ptr, len }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `bytes` into the buffer at `offset`.
    ///
    /// # Errors
    ///
    /// [`Error::ResultSize`] when the write does not fit.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let end = offset.checked_add(bytes.len()).ok_or(Error::ResultSize)?;
        if end > self.len {
            return Err(Error::ResultSize);
        }
        // Safety: bounds checked above; the buffer outlives the invocation
        // and instances write disjoint ranges per the action contract.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }
}

impl fmt::Debug for ResultBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultBuffer").field("len", &self.len).finish()
    }
}

/// Task introspection visible to a running action body.
pub struct TaskContext<'a> {
    task: &'a Task,
    instance_num: u32,
    num_instances: u32,
    core_num: u32,
    thread: ThreadId,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        task: &'a Task,
        instance_num: u32,
        num_instances: u32,
        core_num: u32,
    ) -> TaskContext<'a> {
        TaskContext {
            task,
            instance_num,
            num_instances,
            core_num,
            thread: std::thread::current().id(),
        }
    }

    /// This invocation's instance number, `0..num_instances`.
    #[must_use]
    pub fn instance_number(&self) -> u32 {
        self.instance_num
    }

    /// Total number of parallel instances of the task.
    #[must_use]
    pub fn num_instances(&self) -> u32 {
        self.num_instances
    }

    /// The core number of the executing worker.
    #[must_use]
    pub fn core_number(&self) -> u32 {
        self.core_num
    }

    /// Current state of the task. Long-running bodies poll this to observe a
    /// cooperative cancel and exit early.
    #[must_use]
    pub fn task_state(&self) -> TaskState {
        self.task.state()
    }

    /// Records `status` as the task's error code, surfaced by the waiter.
    ///
    /// # Errors
    ///
    /// [`Error::ContextOutOfContext`] when called from a thread other than
    /// the executing worker, [`Error::Parameter`] for statuses an action is
    /// not allowed to record.
    pub fn set_status(&self, status: Error) -> Result<(), Error> {
        if std::thread::current().id() != self.thread {
            return Err(Error::ContextOutOfContext);
        }
        if !status.is_action_recordable() {
            return Err(Error::Parameter);
        }
        self.task.record_error(status);
        Ok(())
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("instance_num", &self.instance_num)
            .field("num_instances", &self.num_instances)
            .field("core_num", &self.core_num)
            .finish_non_exhaustive()
    }
}
