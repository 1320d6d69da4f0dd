// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Actions: the callable units implementing jobs.
//!
//! An action is either a local function or a plugin driven through the
//! three-callback contract in [`crate::plugin`]. While `num_tasks > 0` the
//! action's slot stays allocated; delete and disable cancel the action's
//! queued tasks and then drain that counter, cooperatively when called from a
//! worker.

use crate::attrs::{ActionAttributes, CoreAffinity};
use crate::context::ActionInput;
use crate::error::Error;
use crate::node::{self, Node};
use crate::plugin::PluginAction;
use crate::pool;
use crate::task::{self, TaskHandle};
use crate::time::Timeout;
use crate::JobId;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::RwLock;
use std::sync::Arc;

/// A local action body.
pub type ActionFunction = Arc<dyn Fn(ActionInput<'_>) + Send + Sync>;

/// Handle to a registered action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionHandle(pub(crate) pool::Handle);

pub(crate) enum ActionKind {
    Local(ActionFunction),
    Plugin(Arc<dyn PluginAction>),
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Local(_) => f.write_str("Local"),
            ActionKind::Plugin(_) => f.write_str("Plugin"),
        }
    }
}

pub(crate) struct Action {
    pub(crate) job_id: JobId,
    pub(crate) kind: ActionKind,
    pub(crate) node_local: Box<[u8]>,
    attributes: RwLock<ActionAttributes>,
    enabled: AtomicBool,
    deleted: AtomicBool,
    pub(crate) num_tasks: AtomicU32,
}

impl Action {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn affinity(&self) -> CoreAffinity {
        self.attributes.read().affinity
    }

    /// The error recorded into tasks that were cancelled because this action
    /// went away under them.
    pub(crate) fn takedown_error(&self) -> Error {
        if self.is_deleted() {
            Error::ActionDeleted
        } else {
            Error::ActionDisabled
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("num_tasks", &self.num_tasks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Registers a local action implementing `job_id`.
///
/// # Errors
///
/// [`Error::NodeNotInit`], [`Error::JobInvalid`] for an out-of-range job id,
/// [`Error::ActionExists`] when the job already has a local action,
/// [`Error::ActionLimit`] when the pool or the per-job list is full, and
/// [`Error::Parameter`] for an empty affinity set.
pub fn create<F>(
    job_id: JobId,
    action_function: F,
    node_local: &[u8],
    attributes: ActionAttributes,
) -> Result<ActionHandle, Error>
where
    F: Fn(ActionInput<'_>) + Send + Sync + 'static,
{
    create_with_kind(
        job_id,
        ActionKind::Local(Arc::new(action_function)),
        node_local,
        attributes,
    )
}

pub(crate) fn create_with_kind(
    job_id: JobId,
    kind: ActionKind,
    node_local: &[u8],
    attributes: ActionAttributes,
) -> Result<ActionHandle, Error> {
    let node = node::instance()?;
    tracing::trace!(job_id, kind = ?kind, "action create");

    let job = node.jobs().get(job_id).ok_or(Error::JobInvalid)?;
    if attributes.affinity.is_empty() {
        return Err(Error::Parameter);
    }

    // one local action per job on this node; plugin actions represent other
    // executors and may stack freely for load balancing
    if matches!(kind, ActionKind::Local(_)) {
        let has_local = job.snapshot().any(|h| {
            node.actions()
                .resolve(h)
                .is_some_and(|a| matches!(a.kind, ActionKind::Local(_)))
        });
        if has_local {
            return Err(Error::ActionExists);
        }
    }

    let action = Action {
        job_id,
        kind,
        node_local: node_local.into(),
        attributes: RwLock::new(attributes),
        enabled: AtomicBool::new(true),
        deleted: AtomicBool::new(false),
        num_tasks: AtomicU32::new(0),
    };

    let handle = node
        .actions()
        .allocate(action)
        .map_err(|_| Error::ActionLimit)?;

    if let Err(e) = job.add_action(handle) {
        node.actions().free(handle);
        return Err(e);
    }

    Ok(ActionHandle(handle))
}

impl ActionHandle {
    /// Disables the action, cancels its queued tasks and waits for the
    /// outstanding-task counter to drain, then removes the action from its
    /// job and frees the slot. Plugin actions get their `finalize` callback.
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`] for stale handles; [`Error::Timeout`] when
    /// tasks are still outstanding at the deadline (the storage is kept).
    pub fn delete(self, timeout: Timeout) -> Result<(), Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        tracing::trace!(action = ?self.0, "action delete");

        action.deleted.store(true, Ordering::Release);
        action.enabled.store(false, Ordering::Release);

        drain(&node, self, timeout)?;

        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        if let Some(job) = node.jobs().get(action.job_id) {
            job.remove_action(self.0);
        }
        if let ActionKind::Plugin(plugin) = &action.kind
            && let Err(e) = plugin.finalize()
        {
            tracing::warn!(action = ?self.0, error = %e, "plugin finalize failed");
        }
        node.actions().free(self.0);
        Ok(())
    }

    /// Disables the action and waits like [`ActionHandle::delete`], but keeps
    /// the registration so it can be re-enabled.
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`] or [`Error::Timeout`].
    pub fn disable(self, timeout: Timeout) -> Result<(), Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        tracing::trace!(action = ?self.0, "action disable");

        action.enabled.store(false, Ordering::Release);
        drain(&node, self, timeout)
    }

    /// Re-enables a disabled action.
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`] for stale or deleted handles.
    pub fn enable(self) -> Result<(), Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        if action.is_deleted() {
            return Err(Error::ActionInvalid);
        }
        action.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Raw attribute write, see [`ActionAttributes::set_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`], [`Error::AttrNum`], [`Error::AttrSize`] or
    /// [`Error::Parameter`].
    pub fn set_attribute(self, id: u32, value: &[u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        action.attributes.write().set_attribute(id, value)
    }

    /// Raw attribute read, see [`ActionAttributes::get_attribute`].
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`], [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        action.attributes.read().get_attribute(id, out)
    }

    /// Number of outstanding tasks bound to this action.
    ///
    /// # Errors
    ///
    /// [`Error::ActionInvalid`] for stale handles.
    pub fn num_tasks(self) -> Result<u32, Error> {
        let node = node::instance()?;
        let action = node.actions().resolve(self.0).ok_or(Error::ActionInvalid)?;
        Ok(action.num_tasks.load(Ordering::Acquire))
    }
}

/// Cancels the action's queued tasks and drains `num_tasks`, executing other
/// work when called from a worker thread.
fn drain(node: &Node, handle: ActionHandle, timeout: Timeout) -> Result<(), Error> {
    let error = node
        .actions()
        .resolve(handle.0)
        .ok_or(Error::ActionInvalid)?
        .takedown_error();

    task::sweep_cancel(node, error, |t| t.action == handle.0);

    let deadline = timeout.deadline();
    node.scheduler().wait_until(node, deadline, || {
        node.actions()
            .resolve(handle.0)
            .is_none_or(|a| a.num_tasks.load(Ordering::Acquire) == 0)
    })
}

/// Forwards a cancel request to the plugin backing `action`, if any.
pub(crate) fn notify_plugin_cancel(node: &Node, action: pool::Handle, task: TaskHandle) {
    if let Some(action) = node.actions().resolve(action)
        && let ActionKind::Plugin(plugin) = &action.kind
        && let Err(e) = plugin.cancel(task)
    {
        tracing::debug!(task = ?task, error = %e, "plugin cancel failed");
    }
}
