// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Plugin actions: externally driven executors (GPU dispatchers, network
//! endpoints) behind the start/cancel/finalize contract.
//!
//! The scheduler invokes [`PluginAction::start`] when a plugin task is pulled
//! from the ready set and then moves on; the worker is never blocked on
//! plugin progress. The plugin drives the task to a terminal state by calling
//! [`task_complete`], which releases waiters exactly like a locally executed
//! task. [`PluginAction::cancel`] is forwarded on a best-effort cancel;
//! [`PluginAction::finalize`] runs when the owning action is deleted.

use crate::action::{self, ActionHandle, ActionKind};
use crate::attrs::ActionAttributes;
use crate::error::Error;
use crate::node;
use crate::task::{self, TaskHandle};
use crate::JobId;
use std::sync::Arc;

/// The three-callback contract of an externally driven action.
pub trait PluginAction: Send + Sync {
    /// Called by the scheduler when a task of this action is dequeued. The
    /// plugin must eventually call [`task_complete`] for the task.
    ///
    /// # Errors
    ///
    /// An error retires the task immediately with that status.
    fn start(&self, task: TaskHandle) -> Result<(), Error>;

    /// Best-effort cancellation of an in-flight plugin task.
    ///
    /// # Errors
    ///
    /// Reported to the tracing log only; cancellation stays cooperative.
    fn cancel(&self, task: TaskHandle) -> Result<(), Error>;

    /// Invoked while the owning action is deleted; the plugin releases its
    /// side data.
    ///
    /// # Errors
    ///
    /// Surfaced as a warning only; action deletion always completes.
    fn finalize(&self) -> Result<(), Error>;
}

/// Registers a plugin action implementing `job_id`.
///
/// Unlike local actions, any number of plugin actions may stack on one job;
/// they represent additional executors for load balancing.
///
/// # Errors
///
/// As [`action::create`], except that [`Error::ActionExists`] is never
/// reported.
pub fn create(
    job_id: JobId,
    plugin: Arc<dyn PluginAction>,
    node_local: &[u8],
    attributes: ActionAttributes,
) -> Result<ActionHandle, Error> {
    action::create_with_kind(job_id, ActionKind::Plugin(plugin), node_local, attributes)
}

/// Completion callback for plugin tasks.
///
/// Copies `result` (if any) into the task's result buffer, records the
/// status, and drives the regular completion path: queue chaining, group
/// completion, counter decrements, waiter wakeup.
///
/// # Errors
///
/// [`Error::NodeNotInit`], [`Error::TaskInvalid`] for stale handles, or
/// [`Error::ResultSize`] when `result` does not fit (the task is then *not*
/// completed).
pub fn task_complete(
    task: TaskHandle,
    status: Result<(), Error>,
    result: Option<&[u8]>,
) -> Result<(), Error> {
    let node = node::instance()?;
    let t = node.tasks().resolve(task.0).ok_or(Error::TaskInvalid)?;

    if let Some(bytes) = result {
        let (ptr, len) = t.result_ptr();
        if bytes.len() > len {
            return Err(Error::ResultSize);
        }
        // Safety: bounds checked; the buffer lives until a waiter takes it,
        // which happens only after the completion below.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
    }
    if let Err(e) = status {
        // a concurrent cancel may have recorded its status already; the
        // first recorded error wins, as everywhere on the completion path
        t.record_error_if_unset(e);
    }

    tracing::trace!(task = ?task.0, ok = status.is_ok(), "plugin task complete");
    task::discard(&node, task.0);
    Ok(())
}

/// Read access to a task's argument buffer, for plugins marshalling work to
/// their device or peer.
///
/// # Errors
///
/// [`Error::NodeNotInit`] or [`Error::TaskInvalid`].
pub fn with_task_args<R>(task: TaskHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, Error> {
    let node = node::instance()?;
    let t = node.tasks().resolve(task.0).ok_or(Error::TaskInvalid)?;
    Ok(f(t.args()))
}

/// Scheduler-visible yield.
///
/// On a worker thread (including a reused main thread) this executes one
/// ready task if any; elsewhere it yields the OS thread. Plugins driving
/// completions from the main thread call this to keep the node making
/// progress.
pub fn yield_now() {
    match node::instance() {
        Ok(node) => node.scheduler().yield_once(&node),
        Err(_) => std::thread::yield_now(),
    }
}
