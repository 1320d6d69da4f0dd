// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Queues: ordered or unordered streams of tasks sharing one job.
//!
//! An ordered queue keeps at most one task (the *active* one) in the
//! scheduler's ready set; later enqueues park in a per-queue backlog. When
//! the active task retires, its completion path promotes the next backlog
//! entry, so enqueue order is execution order and no lock is ever held
//! across task execution. An unordered queue dispatches directly.
//!
//! Disable rejects new enqueues; depending on the retain attribute the
//! backlog is either cancelled or held back (tasks move to `Retained`) for a
//! later enable. Delete frees retained work without executing it.

use crate::attrs::QueueAttributes;
use crate::error::Error;
use crate::job::JobHandle;
use crate::node::{self, Node};
use crate::pool;
use crate::task::{self, TaskBuilder, TaskHandle, TaskState};
use crate::time::Timeout;
use crate::QueueId;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Handle to a task queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub(crate) pool::Handle);

pub(crate) struct Queue {
    pub(crate) queue_id: Option<QueueId>,
    pub(crate) job: JobHandle,
    pub(crate) attributes: QueueAttributes,
    enabled: AtomicBool,
    deleted: AtomicBool,
    /// Tasks attached to the queue that have not finished yet, backlog
    /// included.
    pub(crate) num_tasks: AtomicU32,
    /// Tasks handed to the scheduler that have not finished yet.
    num_dispatched: AtomicU32,
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    backlog: VecDeque<pool::Handle>,
    active: Option<pool::Handle>,
}

impl Queue {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("queue_id", &self.queue_id)
            .field("job", &self.job.id)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("num_tasks", &self.num_tasks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Creates a queue bound to `job`.
///
/// # Errors
///
/// [`Error::NodeNotInit`], [`Error::JobInvalid`] for an out-of-range job,
/// [`Error::Parameter`] for a priority outside the node's range, or
/// [`Error::QueueLimit`] when the pool is full.
pub fn create(
    queue_id: Option<QueueId>,
    job: JobHandle,
    attributes: Option<QueueAttributes>,
) -> Result<QueueHandle, Error> {
    let node = node::instance()?;
    if job.id >= node.attributes().max_jobs {
        return Err(Error::JobInvalid);
    }
    let attributes = attributes.unwrap_or_default();
    if attributes.priority >= node.attributes().max_priorities {
        return Err(Error::Parameter);
    }

    let queue = Queue {
        queue_id,
        job,
        attributes,
        enabled: AtomicBool::new(true),
        deleted: AtomicBool::new(false),
        num_tasks: AtomicU32::new(0),
        num_dispatched: AtomicU32::new(0),
        inner: Mutex::new(QueueInner {
            backlog: VecDeque::new(),
            active: None,
        }),
    };

    let handle = node
        .queues()
        .allocate(queue)
        .map_err(|_| Error::QueueLimit)?;
    tracing::trace!(queue = ?handle, job = job.id, "queue create");
    Ok(QueueHandle(handle))
}

/// Start path for enqueued tasks; called by [`TaskBuilder::enqueue`].
pub(crate) fn enqueue_task(
    node: &Node,
    handle: QueueHandle,
    builder: TaskBuilder,
) -> Result<TaskHandle, Error> {
    let queue = node.queues().resolve(handle.0).ok_or(Error::QueueInvalid)?;
    if queue.deleted.load(Ordering::Acquire) {
        return Err(Error::QueueDeleted);
    }
    if !queue.is_enabled() {
        return Err(Error::QueueDisabled);
    }
    if queue.num_tasks.load(Ordering::Acquire) >= node.attributes().queue_limit {
        return Err(Error::QueueLimit);
    }
    let job = queue.job;
    task::start_task(node, builder, job, Some((handle, handle.0)))
}

/// Attaches an allocated task to the queue and dispatches or parks it.
pub(crate) fn submit(node: &Node, handle: QueueHandle, th: pool::Handle) -> Result<(), Error> {
    let queue = node.queues().resolve(handle.0).ok_or(Error::QueueInvalid)?;
    if queue.deleted.load(Ordering::Acquire) {
        return Err(Error::QueueDeleted);
    }
    if !queue.is_enabled() {
        return Err(Error::QueueDisabled);
    }

    queue.num_tasks.fetch_add(1, Ordering::AcqRel);

    let failed = if queue.attributes.ordered {
        let mut inner = queue.inner.lock();
        if inner.active.is_none() {
            if dispatch(node, queue, th) {
                inner.active = Some(th);
                None
            } else {
                Some(th)
            }
        } else {
            inner.backlog.push_back(th);
            None
        }
    } else if dispatch(node, queue, th) {
        None
    } else {
        Some(th)
    };

    if let Some(th) = failed {
        retire_undispatchable(node, th);
    }
    Ok(())
}

/// Publishes a queue task to the scheduler at the queue's priority.
/// Returns `false` when the ready set is exhausted.
#[must_use]
fn dispatch(node: &Node, queue: &Queue, th: pool::Handle) -> bool {
    queue.num_dispatched.fetch_add(1, Ordering::AcqRel);
    if node
        .scheduler()
        .publish(node, th.into_bits(), queue.attributes.priority, true)
    {
        true
    } else {
        queue.num_dispatched.fetch_sub(1, Ordering::AcqRel);
        false
    }
}

/// Retires a task that could not be handed to the scheduler. Must be called
/// without holding the queue's inner lock: the completion path re-enters the
/// queue.
fn retire_undispatchable(node: &Node, th: pool::Handle) {
    tracing::warn!(task = ?th, "dispatch failed, ready set exhausted");
    if let Some(t) = node.tasks().resolve(th) {
        t.record_error_if_unset(Error::TaskLimit);
        t.cas_state(TaskState::Scheduled, TaskState::Cancelled);
    }
    task::discard(node, th);
}

/// Completion hook: retires `th` from the queue's accounting and, for an
/// ordered queue, promotes the next backlog entry.
pub(crate) fn on_task_finished(node: &Node, q: pool::Handle, th: pool::Handle) {
    let Some(queue) = node.queues().resolve(q) else {
        return;
    };
    queue.num_tasks.fetch_sub(1, Ordering::AcqRel);

    if queue.attributes.ordered {
        let failed = {
            let mut inner = queue.inner.lock();
            if inner.active == Some(th) {
                inner.active = None;
                queue.num_dispatched.fetch_sub(1, Ordering::AcqRel);
                activate_next(node, queue, &mut inner)
            } else {
                // the task was retired straight out of the backlog
                Vec::new()
            }
        };
        for th in failed {
            retire_undispatchable(node, th);
        }
    } else {
        queue.num_dispatched.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Promotes backlog entries until one dispatches. Returns the entries that
/// could not be dispatched; the caller retires them after unlocking.
#[must_use]
fn activate_next(node: &Node, queue: &Queue, inner: &mut QueueInner) -> Vec<pool::Handle> {
    let mut failed = Vec::new();
    if !queue.is_enabled() && queue.attributes.retain {
        // chain pauses; enable resumes it
        return failed;
    }
    while let Some(next) = inner.backlog.pop_front() {
        // entries retired by a cancel are left behind as garbage
        let live = node
            .tasks()
            .resolve(next)
            .is_some_and(|t| !t.state().is_terminal());
        if !live {
            continue;
        }
        if dispatch(node, queue, next) {
            inner.active = Some(next);
            break;
        }
        failed.push(next);
    }
    failed
}

impl QueueHandle {
    /// Stops the queue accepting work.
    ///
    /// With the retain attribute set, backlog tasks move to `Retained` and
    /// survive for a later [`QueueHandle::enable`]; the wait covers only
    /// already-dispatched tasks. Without it, everything attached to the
    /// queue is cancelled and the wait drains the full task count.
    ///
    /// # Errors
    ///
    /// [`Error::QueueInvalid`] or [`Error::Timeout`] (queue state is kept).
    pub fn disable(self, timeout: Timeout) -> Result<(), Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        tracing::trace!(queue = ?self.0, "queue disable");
        queue.enabled.store(false, Ordering::Release);

        let deadline = timeout.deadline();
        if queue.attributes.retain {
            {
                let inner = queue.inner.lock();
                for &th in &inner.backlog {
                    if let Some(t) = node.tasks().resolve(th) {
                        t.cas_state(TaskState::Scheduled, TaskState::Retained);
                    }
                }
            }
            node.scheduler().wait_until(&node, deadline, || {
                node.queues()
                    .resolve(self.0)
                    .is_none_or(|q| q.num_dispatched.load(Ordering::Acquire) == 0)
            })
        } else {
            task::sweep_cancel(&node, Error::QueueDisabled, |t| t.queue == Some(self.0));
            node.scheduler().wait_until(&node, deadline, || {
                node.queues()
                    .resolve(self.0)
                    .is_none_or(|q| q.num_tasks.load(Ordering::Acquire) == 0)
            })
        }
    }

    /// Reopens a disabled queue and resumes its retained backlog.
    ///
    /// # Errors
    ///
    /// [`Error::QueueInvalid`] for stale handles, [`Error::QueueDeleted`]
    /// mid-delete.
    pub fn enable(self) -> Result<(), Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        if queue.deleted.load(Ordering::Acquire) {
            return Err(Error::QueueDeleted);
        }
        tracing::trace!(queue = ?self.0, "queue enable");
        queue.enabled.store(true, Ordering::Release);

        let failed = {
            let mut inner = queue.inner.lock();
            for &th in &inner.backlog {
                if let Some(t) = node.tasks().resolve(th) {
                    t.cas_state(TaskState::Retained, TaskState::Scheduled);
                }
            }
            if inner.active.is_none() {
                activate_next(&node, queue, &mut inner)
            } else {
                Vec::new()
            }
        };
        for th in failed {
            retire_undispatchable(&node, th);
        }
        Ok(())
    }

    /// Deletes the queue. Retained and backlogged tasks are freed without
    /// executing; dispatched tasks are cancelled and awaited.
    ///
    /// # Errors
    ///
    /// [`Error::QueueInvalid`] or [`Error::Timeout`] (storage is kept so the
    /// delete can be retried).
    pub fn delete(self, timeout: Timeout) -> Result<(), Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        tracing::trace!(queue = ?self.0, "queue delete");
        queue.deleted.store(true, Ordering::Release);
        queue.enabled.store(false, Ordering::Release);

        let drained: Vec<pool::Handle> = {
            let mut inner = queue.inner.lock();
            inner.backlog.drain(..).collect()
        };
        for th in drained {
            if let Some(t) = node.tasks().resolve(th) {
                t.record_error_if_unset(Error::QueueDeleted);
                t.cas_state(TaskState::Scheduled, TaskState::Cancelled);
                t.cas_state(TaskState::Retained, TaskState::Cancelled);
            }
            task::discard(&node, th);
        }
        task::sweep_cancel(&node, Error::QueueDeleted, |t| t.queue == Some(self.0));

        let deadline = timeout.deadline();
        node.scheduler().wait_until(&node, deadline, || {
            node.queues()
                .resolve(self.0)
                .is_none_or(|q| q.num_tasks.load(Ordering::Acquire) == 0)
        })?;

        node.queues().free(self.0);
        Ok(())
    }

    /// Queue attributes are fixed at creation.
    ///
    /// # Errors
    ///
    /// [`Error::AttrReadonly`] for known ids, [`Error::AttrNum`] otherwise.
    pub fn set_attribute(self, id: u32, value: &[u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        // probe the id against a scratch copy to report AttrNum for unknown ids
        let mut scratch = queue.attributes.clone();
        scratch.set_attribute(id, value)?;
        Err(Error::AttrReadonly)
    }

    /// Raw attribute read, see [`QueueAttributes::get_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::QueueInvalid`], [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        queue.attributes.get_attribute(id, out)
    }

    /// Number of tasks attached to the queue that have not finished.
    ///
    /// # Errors
    ///
    /// [`Error::QueueInvalid`] for stale handles.
    pub fn num_tasks(self) -> Result<u32, Error> {
        let node = node::instance()?;
        let queue = node.queues().resolve(self.0).ok_or(Error::QueueInvalid)?;
        Ok(queue.num_tasks.load(Ordering::Acquire))
    }
}
