// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Groups: completion joins across any number of tasks.
//!
//! Completers push finished task handles onto the group's lock-free
//! completion queue and decrement `num_tasks`; waiters drain the queue.
//! `wait_all` returns once everything drained, `wait_any` consumes exactly
//! one completion per call. A successful `wait_all` (and a `wait_any` that
//! finds the group empty) deletes the group, invalidating the handle.

use crate::attrs::GroupAttributes;
use crate::error::Error;
use crate::fifo::Fifo;
use crate::node::{self, Node};
use crate::pool;
use crate::time::Timeout;
use crate::GroupId;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Handle to a task group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub(crate) pool::Handle);

pub(crate) struct Group {
    pub(crate) group_id: Option<GroupId>,
    pub(crate) attributes: GroupAttributes,
    deleted: AtomicBool,
    pub(crate) num_tasks: AtomicU32,
    pub(crate) completed: Fifo,
}

impl Group {
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("group_id", &self.group_id)
            .field("num_tasks", &self.num_tasks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Creates a group.
///
/// # Errors
///
/// [`Error::NodeNotInit`] or [`Error::GroupLimit`] when the pool is full.
pub fn create(
    group_id: Option<GroupId>,
    attributes: Option<GroupAttributes>,
) -> Result<GroupHandle, Error> {
    let node = node::instance()?;

    let group = Group {
        group_id,
        attributes: attributes.unwrap_or_default(),
        deleted: AtomicBool::new(false),
        num_tasks: AtomicU32::new(0),
        completed: Fifo::with_capacity(node.attributes().max_tasks as usize),
    };

    let handle = node
        .groups()
        .allocate(group)
        .map_err(|_| Error::GroupLimit)?;
    tracing::trace!(group = ?handle, "group create");
    Ok(GroupHandle(handle))
}

impl GroupHandle {
    /// Waits until every task started into the group has completed and been
    /// consumed, then deletes the group.
    ///
    /// Returns the error of one failed task if any task failed. On timeout
    /// the group survives and the wait can be retried.
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`], [`Error::Timeout`], or the first failed
    /// task's status.
    pub fn wait_all(self, timeout: Timeout) -> Result<(), Error> {
        let node = node::instance()?;
        let group = node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        let deadline = timeout.deadline();
        let mut first_failure: Option<Error> = None;

        tracing::trace!(group = ?self.0, "wait_all");
        loop {
            while let Some(bits) = group.completed.pop() {
                let th = pool::Handle::from_bits(bits);
                if let Some(task) = node.tasks().resolve(th) {
                    if let Some(e) = task.error() {
                        first_failure.get_or_insert(e);
                    }
                    node.tasks().free(th);
                }
            }

            if group.num_tasks.load(Ordering::Acquire) == 0 && group.completed.is_empty() {
                break;
            }
            if deadline.expired() {
                return Err(Error::Timeout);
            }

            node.scheduler().run_or_block(&node, &deadline);
        }

        self.delete_in(&node)?;
        first_failure.map_or(Ok(()), Err)
    }

    /// Consumes exactly one completed task and returns its result buffer.
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`], [`Error::Timeout`],
    /// [`Error::GroupCompleted`] when no tasks are left (the group is deleted
    /// then), or the consumed task's recorded status.
    pub fn wait_any(self, timeout: Timeout) -> Result<Box<[u8]>, Error> {
        let node = node::instance()?;
        let group = node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        let deadline = timeout.deadline();

        tracing::trace!(group = ?self.0, "wait_any");
        loop {
            if let Some(bits) = group.completed.pop() {
                let th = pool::Handle::from_bits(bits);
                let Some(task) = node.tasks().resolve(th) else {
                    continue;
                };
                let error = task.error();
                let result = task_result(task);
                node.tasks().free(th);
                return match error {
                    Some(e) => Err(e),
                    None => Ok(result),
                };
            }

            if group.num_tasks.load(Ordering::Acquire) == 0 && group.completed.is_empty() {
                self.delete_in(&node)?;
                return Err(Error::GroupCompleted);
            }
            if deadline.expired() {
                return Err(Error::Timeout);
            }

            node.scheduler().run_or_block(&node, &deadline);
        }
    }

    /// Deletes the group. Tasks still outstanding keep running; their
    /// completions are dropped.
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`] for stale or already-deleted handles.
    pub fn delete(self) -> Result<(), Error> {
        let node = node::instance()?;
        self.delete_in(&node)
    }

    fn delete_in(self, node: &Node) -> Result<(), Error> {
        let group = node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        if group.deleted.swap(true, Ordering::AcqRel) {
            return Err(Error::GroupInvalid);
        }
        // consume completions that arrived but were never waited for
        while let Some(bits) = group.completed.pop() {
            node.tasks().free(pool::Handle::from_bits(bits));
        }
        tracing::trace!(group = ?self.0, "group delete");
        node.groups().free(self.0);
        Ok(())
    }

    /// Raw attribute write, see [`GroupAttributes::set_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`] or [`Error::AttrNum`].
    pub fn set_attribute(self, id: u32, value: &[u8]) -> Result<(), Error> {
        let node = node::instance()?;
        node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        // groups define no mutable attributes
        GroupAttributes::new().set_attribute(id, value)
    }

    /// Raw attribute read, see [`GroupAttributes::get_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`] or [`Error::AttrNum`].
    pub fn get_attribute(self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let group = node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        group.attributes.get_attribute(id, out)
    }

    /// Number of tasks still outstanding in the group.
    ///
    /// # Errors
    ///
    /// [`Error::GroupInvalid`] for stale handles.
    pub fn num_tasks(self) -> Result<u32, Error> {
        let node = node::instance()?;
        let group = node.groups().resolve(self.0).ok_or(Error::GroupInvalid)?;
        Ok(group.num_tasks.load(Ordering::Acquire))
    }
}

fn task_result(task: &crate::task::Task) -> Box<[u8]> {
    task.take_result().unwrap_or_default()
}
