// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: the unit of work.
//!
//! A task carries its argument bytes, a result buffer, the resolved action,
//! optional group and queue linkage, and an atomic state machine:
//!
//! ```text
//! Created ─▶ Scheduled ─▶ Running ─▶ Completed | Error
//!                │  ▲
//!                ▼  │ (queue re-enable)
//!             Retained ─▶ Cancelled ◀─ (cancel from Scheduled/Running)
//! ```
//!
//! All transitions are compare-and-swap; `Cancelled` entries still sitting in
//! scheduler queues are discarded when pulled. For a task with `n` instances
//! the handle is published once and republished after each instance claim, so
//! at most one stale entry per claim ever exists; `instances_todo` elects the
//! completer that runs the finish path.

use crate::attrs::TaskAttributes;
use crate::error::Error;
use crate::group::GroupHandle;
use crate::job::JobHandle;
use crate::node::{self, Node};
use crate::pool;
use crate::queue::QueueHandle;
use crate::time::Timeout;
use crate::TaskId;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;

/// Handle to a started task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) pool::Handle);

/// Lifecycle states of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaskState {
    Created = 0,
    /// Ready, sitting in a scheduler queue or a queue backlog.
    Scheduled = 1,
    Running = 2,
    /// Held back in a disabled queue that retains its tasks.
    Retained = 3,
    Cancelled = 4,
    Completed = 5,
    /// Terminal with a recorded error code.
    Error = 6,
}

impl TaskState {
    fn from_raw(raw: u32) -> TaskState {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Running,
            3 => TaskState::Retained,
            4 => TaskState::Cancelled,
            5 => TaskState::Completed,
            _ => TaskState::Error,
        }
    }

    /// `true` for `Completed`, `Cancelled` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Error
        )
    }
}

pub(crate) struct Task {
    pub(crate) task_id: Option<TaskId>,
    pub(crate) job: JobHandle,
    pub(crate) action: pool::Handle,
    pub(crate) group: Option<pool::Handle>,
    pub(crate) queue: Option<pool::Handle>,
    pub(crate) attributes: TaskAttributes,
    args: Box<[u8]>,
    result: ResultSlot,
    state: AtomicU32,
    error: AtomicU32,
    current_instance: AtomicU32,
    instances_todo: AtomicU32,
}

/// The task-owned result buffer.
///
/// The boxed allocation never moves, so the raw pointer captured at
/// construction stays valid for instance writes until the buffer is taken by
/// the waiter, which happens only after the task is terminal.
struct ResultSlot {
    buf: Mutex<Option<Box<[u8]>>>,
    ptr: *mut u8,
    len: usize,
}

// Safety: the raw pointer aliases the boxed buffer guarded by the slot's
// protocol (instances write before completion, the waiter takes after).
unsafe impl Send for ResultSlot {}
// Safety: see above.
unsafe impl Sync for ResultSlot {}

impl ResultSlot {
    fn with_capacity(len: usize) -> ResultSlot {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        ResultSlot {
            buf: Mutex::new(Some(buf)),
            ptr,
            len,
        }
    }

    fn take(&self) -> Option<Box<[u8]>> {
        self.buf.lock().take()
    }
}

impl Task {
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn cas_state(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        Error::decode(self.error.load(Ordering::Acquire))
    }

    pub(crate) fn record_error(&self, error: Error) {
        self.error.store(Error::encode(Some(error)), Ordering::Release);
    }

    pub(crate) fn record_error_if_unset(&self, error: Error) {
        let _ = self.error.compare_exchange(
            0,
            Error::encode(Some(error)),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn args(&self) -> &[u8] {
        &self.args
    }

    pub(crate) fn result_ptr(&self) -> (*mut u8, usize) {
        (self.result.ptr, self.result.len)
    }

    pub(crate) fn num_instances(&self) -> u32 {
        self.attributes.instances
    }

    /// Claims the next unclaimed instance number.
    pub(crate) fn claim_instance(&self) -> Option<u32> {
        let i = self.current_instance.fetch_add(1, Ordering::AcqRel);
        (i < self.attributes.instances).then_some(i)
    }

    /// Claims every instance that has not been claimed yet, returning how
    /// many were taken. Used when a task is discarded without running.
    pub(crate) fn claim_remaining(&self) -> u32 {
        let n = self.attributes.instances;
        let prev = self.current_instance.swap(n, Ordering::AcqRel).min(n);
        n - prev
    }

    /// Marks `count` instances as done; `true` elects the caller as the
    /// task's completer.
    pub(crate) fn instances_done(&self, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        self.instances_todo.fetch_sub(count, Ordering::AcqRel) == count
    }

    /// Takes the result buffer out of the task; at most one caller gets it.
    pub(crate) fn take_result(&self) -> Option<Box<[u8]>> {
        self.result.take()
    }

    fn terminal_error(&self) -> Option<Error> {
        match self.state() {
            TaskState::Cancelled => Some(self.error().unwrap_or(Error::ActionCancelled)),
            TaskState::Error => Some(self.error().unwrap_or(Error::Unknown)),
            _ => None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("job", &self.job.id)
            .field("state", &self.state())
            .field("instances", &self.attributes.instances)
            .finish_non_exhaustive()
    }
}

/// Configures and starts tasks.
///
/// ```no_run
/// # use taskrt::task::TaskBuilder;
/// # let job = taskrt::job::get(1, 0).unwrap();
/// let task = TaskBuilder::new()
///     .args(7u32.to_ne_bytes())
///     .result_capacity(4)
///     .start(job)
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct TaskBuilder {
    task_id: Option<TaskId>,
    args: Box<[u8]>,
    result_capacity: usize,
    attributes: TaskAttributes,
    group: Option<GroupHandle>,
}

impl TaskBuilder {
    #[must_use]
    pub fn new() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// Client-chosen task id, informational only.
    #[must_use]
    pub fn task_id(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }

    /// Argument bytes, moved into the task.
    #[must_use]
    pub fn args(mut self, args: impl Into<Box<[u8]>>) -> Self {
        self.args = args.into();
        self
    }

    /// Size of the result buffer the runtime allocates for this task.
    #[must_use]
    pub fn result_capacity(mut self, len: usize) -> Self {
        self.result_capacity = len;
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: TaskAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.attributes.priority = priority;
        self
    }

    #[must_use]
    pub fn instances(mut self, instances: u32) -> Self {
        self.attributes.instances = instances;
        self
    }

    #[must_use]
    pub fn detached(mut self, detached: bool) -> Self {
        self.attributes.detached = detached;
        self
    }

    /// Starts the task into `group`; its completion is consumed by the
    /// group's wait operations.
    #[must_use]
    pub fn group(mut self, group: GroupHandle) -> Self {
        self.group = Some(group);
        self
    }

    /// Starts the task through `job`'s action list.
    ///
    /// # Errors
    ///
    /// [`Error::JobInvalid`], [`Error::ActionDisabled`],
    /// [`Error::ActionInvalid`], [`Error::TaskLimit`],
    /// [`Error::GroupInvalid`] and [`Error::Parameter`] per the start
    /// protocol.
    pub fn start(self, job: JobHandle) -> Result<TaskHandle, Error> {
        let node = node::instance()?;
        start_task(&node, self, job, None)
    }

    /// Enqueues the task on `queue`, which supplies the job and the
    /// execution priority.
    ///
    /// # Errors
    ///
    /// As [`TaskBuilder::start`], plus [`Error::QueueInvalid`],
    /// [`Error::QueueDisabled`], [`Error::QueueDeleted`] and
    /// [`Error::QueueLimit`].
    pub fn enqueue(self, queue: QueueHandle) -> Result<TaskHandle, Error> {
        let node = node::instance()?;
        crate::queue::enqueue_task(&node, queue, self)
    }
}

impl TaskHandle {
    /// Blocks until the task is terminal and returns its result buffer.
    ///
    /// On a worker thread this cooperatively executes other ready tasks
    /// instead of blocking. The task's slot is reclaimed on return unless the
    /// task belongs to a group (the group's waiter reclaims it then).
    ///
    /// # Errors
    ///
    /// The error the action recorded ([`Error::ActionFailed`] and friends),
    /// [`Error::ActionCancelled`] for cancelled tasks, [`Error::Timeout`],
    /// or [`Error::TaskInvalid`] for stale handles and detached tasks.
    pub fn wait(self, timeout: Timeout) -> Result<Box<[u8]>, Error> {
        let node = node::instance()?;

        {
            let task = node.tasks().resolve(self.0).ok_or(Error::TaskInvalid)?;
            if task.attributes.detached {
                return Err(Error::TaskInvalid);
            }
        }

        let deadline = timeout.deadline();
        node.scheduler().wait_until(&node, deadline, || {
            node.tasks()
                .resolve(self.0)
                .is_none_or(|t| t.state().is_terminal())
        })?;

        let Some(task) = node.tasks().resolve(self.0) else {
            // reclaimed concurrently (e.g. by a group waiter)
            return Err(Error::TaskInvalid);
        };
        let error = task.terminal_error();
        let result = task.result.take();
        if task.group.is_none() {
            node.tasks().free(self.0);
        }

        match error {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or_default()),
        }
    }

    /// Requests cancellation.
    ///
    /// A task still in a queue is cancelled instantly; a running task only
    /// observes the request through [`TaskContext::task_state`] and is
    /// expected to exit early.
    ///
    /// # Errors
    ///
    /// [`Error::TaskInvalid`] for stale handles.
    ///
    /// [`TaskContext::task_state`]: crate::context::TaskContext::task_state
    pub fn cancel(self) -> Result<(), Error> {
        let node = node::instance()?;
        let task = node.tasks().resolve(self.0).ok_or(Error::TaskInvalid)?;

        loop {
            match task.state() {
                TaskState::Created | TaskState::Scheduled | TaskState::Retained => {
                    let from = task.state();
                    if task.cas_state(from, TaskState::Cancelled) {
                        task.record_error_if_unset(Error::ActionCancelled);
                        tracing::trace!(task = ?self.0, "cancelled before running");
                        // retire right away; entries still sitting in queues
                        // become garbage that the pullers skip
                        discard(&node, self.0);
                        return Ok(());
                    }
                }
                TaskState::Running => {
                    if task.cas_state(TaskState::Running, TaskState::Cancelled) {
                        task.record_error_if_unset(Error::ActionCancelled);
                        crate::action::notify_plugin_cancel(&node, task.action, self);
                        // instances that were never claimed will not run;
                        // account for them so the completer can be elected
                        let unclaimed = task.claim_remaining();
                        if task.instances_done(unclaimed) {
                            finish(&node, self.0);
                        }
                        return Ok(());
                    }
                }
                TaskState::Cancelled | TaskState::Completed | TaskState::Error => return Ok(()),
            }
        }
    }

    /// Current state of the task.
    ///
    /// # Errors
    ///
    /// [`Error::TaskInvalid`] for stale handles.
    pub fn state(self) -> Result<TaskState, Error> {
        let node = node::instance()?;
        let task = node.tasks().resolve(self.0).ok_or(Error::TaskInvalid)?;
        Ok(task.state())
    }

    /// Raw attribute read, see [`TaskAttributes::get_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::TaskInvalid`], [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let task = node.tasks().resolve(self.0).ok_or(Error::TaskInvalid)?;
        task.attributes.get_attribute(id, out)
    }
}

/// Selects an enabled action implementing `job`, round-robin.
pub(crate) fn select_action(node: &Node, job: &crate::job::Job) -> Result<pool::Handle, Error> {
    let handles: Vec<pool::Handle> = job.snapshot().collect();
    if handles.is_empty() {
        return Err(Error::JobInvalid);
    }

    let start = job.next_round_robin() as usize % handles.len();
    let mut saw_live = false;
    for k in 0..handles.len() {
        let h = handles[(start + k) % handles.len()];
        if let Some(action) = node.actions().resolve(h) {
            saw_live = true;
            if action.is_enabled() {
                return Ok(h);
            }
        }
    }

    if saw_live {
        Err(Error::ActionDisabled)
    } else {
        Err(Error::ActionInvalid)
    }
}

/// The common start path: resolve, validate, allocate, count, publish.
pub(crate) fn start_task(
    node: &Node,
    builder: TaskBuilder,
    job: JobHandle,
    queue: Option<(QueueHandle, pool::Handle)>,
) -> Result<TaskHandle, Error> {
    if job.id >= node.attributes().max_jobs {
        return Err(Error::JobInvalid);
    }
    let job_rec = node.jobs().get(job.id).ok_or(Error::JobInvalid)?;

    let attributes = builder.attributes.clone();
    if attributes.priority >= node.attributes().max_priorities {
        return Err(Error::Parameter);
    }
    if attributes.detached && builder.group.is_some() {
        return Err(Error::Parameter);
    }

    let group_h = builder.group.map(|g| g.0);
    if let Some(g) = group_h {
        let group = node.groups().resolve(g).ok_or(Error::GroupInvalid)?;
        if group.is_deleted() {
            return Err(Error::GroupInvalid);
        }
    }

    let action_h = select_action(node, job_rec)?;

    let instances = attributes.instances;
    let task = Task {
        task_id: builder.task_id,
        job,
        action: action_h,
        group: group_h,
        queue: queue.map(|(_, h)| h),
        attributes,
        args: builder.args,
        result: ResultSlot::with_capacity(builder.result_capacity),
        state: AtomicU32::new(TaskState::Created as u32),
        error: AtomicU32::new(0),
        current_instance: AtomicU32::new(0),
        instances_todo: AtomicU32::new(instances),
    };

    let handle = node.tasks().allocate(task).map_err(|_| Error::TaskLimit)?;
    let task = node.tasks().resolve(handle).expect("slot just allocated");

    // outstanding-use counters, taken before the task becomes visible
    if let Some(g) = group_h {
        match node.groups().resolve(g) {
            Some(group) => {
                group.num_tasks.fetch_add(1, Ordering::AcqRel);
            }
            None => {
                node.tasks().free(handle);
                return Err(Error::GroupInvalid);
            }
        }
    }
    match node.actions().resolve(action_h) {
        Some(action) => {
            action.num_tasks.fetch_add(1, Ordering::AcqRel);
        }
        None => {
            if let Some(g) = group_h
                && let Some(group) = node.groups().resolve(g)
            {
                group.num_tasks.fetch_sub(1, Ordering::AcqRel);
            }
            node.tasks().free(handle);
            return Err(Error::ActionInvalid);
        }
    }

    task.set_state(TaskState::Scheduled);
    tracing::trace!(task = ?handle, job = job.id, "task start");

    match queue {
        Some((qh, _)) => {
            if let Err(e) = crate::queue::submit(node, qh, handle) {
                rollback(node, handle);
                return Err(e);
            }
        }
        None => {
            let priority = task.attributes.priority;
            if !node.scheduler().publish(node, handle.into_bits(), priority, true) {
                rollback(node, handle);
                return Err(Error::TaskLimit);
            }
        }
    }

    Ok(TaskHandle(handle))
}

/// Undoes the counter increments of a failed publish and frees the slot.
pub(crate) fn rollback(node: &Node, handle: pool::Handle) {
    let Some(task) = node.tasks().resolve(handle) else {
        return;
    };
    if let Some(g) = task.group
        && let Some(group) = node.groups().resolve(g)
    {
        group.num_tasks.fetch_sub(1, Ordering::AcqRel);
    }
    if let Some(action) = node.actions().resolve(task.action) {
        action.num_tasks.fetch_sub(1, Ordering::AcqRel);
    }
    node.tasks().free(handle);
}

/// Completion path. Runs exactly once per task, on the thread that retired
/// the last instance (or discarded the task).
pub(crate) fn finish(node: &Node, handle: pool::Handle) {
    let Some(task) = node.tasks().resolve(handle) else {
        return;
    };

    let final_state = match task.state() {
        TaskState::Cancelled => {
            task.record_error_if_unset(Error::ActionCancelled);
            TaskState::Cancelled
        }
        _ if task.error().is_some() => TaskState::Error,
        _ => TaskState::Completed,
    };
    task.set_state(final_state);
    tracing::trace!(task = ?handle, state = ?final_state, "task finished");

    if let Some(action) = node.actions().resolve(task.action) {
        action.num_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    let group = task.group;
    let detached = task.attributes.detached;

    if let Some(q) = task.queue {
        crate::queue::on_task_finished(node, q, handle);
    }

    match group {
        Some(g) => match node.groups().resolve(g) {
            Some(grp) => {
                grp.completed.push(handle.into_bits());
                grp.num_tasks.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                // the group was deleted out from under the task; no waiter
                // will ever consume the completion, reclaim the slot here
                node.tasks().free(handle);
            }
        },
        None => {
            if detached {
                node.tasks().free(handle);
            }
        }
    }

    node.scheduler().notify_completion();
}

/// Retires a task without running it: claims all unclaimed instances and, if
/// that empties the task, runs the completion path.
pub(crate) fn discard(node: &Node, handle: pool::Handle) {
    let Some(task) = node.tasks().resolve(handle) else {
        return;
    };
    let unclaimed = task.claim_remaining();
    if task.instances_done(unclaimed) {
        finish(node, handle);
    }
}

/// Cancels and retires every live, not-yet-running task matching `pred`,
/// recording `error` as its error code. Running tasks are left to finish on
/// their own.
pub(crate) fn sweep_cancel(node: &Node, error: Error, mut pred: impl FnMut(&Task) -> bool) {
    let mut cancelled = Vec::new();
    node.tasks().for_each(|handle, task| {
        if !pred(task) {
            return;
        }
        for from in [TaskState::Scheduled, TaskState::Retained] {
            if task.cas_state(from, TaskState::Cancelled) {
                task.record_error_if_unset(error);
                cancelled.push(handle);
                break;
            }
        }
    });
    for handle in cancelled {
        discard(node, handle);
    }
}
