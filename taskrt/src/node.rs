// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The node: process-local owner of all pools and the scheduler.
//!
//! One node exists per process at a time, created by [`initialize`] and torn
//! down by [`finalize`]; re-initialization afterwards is allowed. Access from
//! the rest of the crate goes through [`instance`], which reports
//! [`Error::NodeNotInit`] outside the initialize/finalize window.

use crate::action::Action;
use crate::attrs::NodeAttributes;
use crate::error::Error;
use crate::group::Group;
use crate::job::JobTable;
use crate::pool::Pool;
use crate::queue::Queue;
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::{DomainId, NodeId};
use core::fmt;
use parking_lot::RwLock;
use std::sync::Arc;

static INSTANCE: RwLock<Option<Arc<Node>>> = RwLock::new(None);

/// Runtime facts reported by [`initialize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub version_major: u16,
    pub version_minor: u16,
    /// Cores available on the machine.
    pub hardware_concurrency: u32,
    /// Worker contexts of this node (including a reused main thread).
    pub num_workers: u32,
}

pub struct Node {
    domain_id: DomainId,
    node_id: NodeId,
    attributes: NodeAttributes,
    info: NodeInfo,
    jobs: JobTable,
    actions: Pool<Action>,
    groups: Pool<Group>,
    tasks: Pool<Task>,
    queues: Pool<Queue>,
    scheduler: Scheduler,
}

impl Node {
    pub(crate) fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub(crate) fn attributes(&self) -> &NodeAttributes {
        &self.attributes
    }

    pub(crate) fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub(crate) fn actions(&self) -> &Pool<Action> {
        &self.actions
    }

    pub(crate) fn groups(&self) -> &Pool<Group> {
        &self.groups
    }

    pub(crate) fn tasks(&self) -> &Pool<Task> {
        &self.tasks
    }

    pub(crate) fn queues(&self) -> &Pool<Queue> {
        &self.queues
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("domain_id", &self.domain_id)
            .field("node_id", &self.node_id)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Cores the runtime may schedule onto, as logical indices into the OS core
/// list.
fn available_cores() -> u32 {
    let by_ids = core_affinity::get_core_ids().map_or(0, |ids| ids.len());
    let n = if by_ids > 0 {
        by_ids
    } else {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    };
    u32::try_from(n.min(crate::attrs::CoreAffinity::MAX_CORES as usize)).expect("core count fits")
}

/// Creates the node singleton and starts its workers.
///
/// # Errors
///
/// [`Error::NodeInitialized`] when a node already exists,
/// [`Error::Parameter`] for an affinity that selects no available core, and
/// [`Error::NodeInitFailed`] when worker threads cannot be started (the
/// partial node is unwound).
pub fn initialize(
    domain_id: DomainId,
    node_id: NodeId,
    attributes: NodeAttributes,
) -> Result<NodeInfo, Error> {
    let mut guard = INSTANCE.write();
    if guard.is_some() {
        return Err(Error::NodeInitialized);
    }

    if attributes.max_priorities == 0
        || attributes.max_tasks == 0
        || attributes.max_jobs == 0
        || attributes.max_actions == 0
    {
        return Err(Error::Parameter);
    }
    let num_cores = available_cores();
    let affinity = attributes.core_affinity.clamp_to(num_cores);
    if affinity.is_empty() {
        return Err(Error::Parameter);
    }
    let cores: Vec<u32> = affinity.iter().collect();

    let mut attributes = attributes;
    attributes.num_cores = num_cores;

    let info = NodeInfo {
        version_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        version_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        hardware_concurrency: num_cores,
        num_workers: u32::try_from(cores.len()).expect("worker count fits"),
    };

    tracing::debug!(domain_id, node_id, workers = cores.len(), "node initialize");

    let node = Arc::new(Node {
        domain_id,
        node_id,
        jobs: JobTable::new(attributes.max_jobs, attributes.max_actions_per_job),
        actions: Pool::with_capacity(attributes.max_actions),
        groups: Pool::with_capacity(attributes.max_groups),
        tasks: Pool::with_capacity(attributes.max_tasks),
        queues: Pool::with_capacity(attributes.max_queues),
        scheduler: Scheduler::new(
            attributes.max_priorities,
            attributes.max_tasks,
            &cores,
            attributes.reuse_main_thread,
        ),
        info,
        attributes,
    });

    if let Err(e) = node.scheduler.start(&node) {
        node.scheduler.shutdown();
        return Err(e);
    }
    if node.attributes.reuse_main_thread {
        node.scheduler.register_main_thread();
    }

    *guard = Some(node);
    Ok(info)
}

/// Tears the node down: stops and joins the workers, then drops the pools
/// (and with them any task that never ran).
///
/// # Errors
///
/// [`Error::NodeNotInit`] when no node exists.
pub fn finalize() -> Result<(), Error> {
    // take the singleton out first so concurrent lookups fail fast and the
    // workers being joined can still finish their current tasks
    let node = { INSTANCE.write().take() }.ok_or(Error::NodeNotInit)?;
    tracing::debug!("node finalize");
    node.scheduler.shutdown();
    drop(node);
    Ok(())
}

#[must_use]
pub fn is_initialized() -> bool {
    INSTANCE.read().is_some()
}

/// The live node.
///
/// # Errors
///
/// [`Error::NodeNotInit`] outside the initialize/finalize window.
pub(crate) fn instance() -> Result<Arc<Node>, Error> {
    INSTANCE.read().clone().ok_or(Error::NodeNotInit)
}

/// This node's domain id.
///
/// # Errors
///
/// [`Error::NodeNotInit`].
pub fn domain_id() -> Result<DomainId, Error> {
    Ok(instance()?.domain_id)
}

/// This node's node id.
///
/// # Errors
///
/// [`Error::NodeNotInit`].
pub fn node_id() -> Result<NodeId, Error> {
    Ok(instance()?.node_id)
}

/// The [`NodeInfo`] reported at initialization.
///
/// # Errors
///
/// [`Error::NodeNotInit`].
pub fn info() -> Result<NodeInfo, Error> {
    Ok(instance()?.info)
}

/// Raw node attribute read, see [`NodeAttributes::get_attribute`].
///
/// # Errors
///
/// [`Error::NodeNotInit`], [`Error::AttrNum`] or [`Error::AttrSize`].
pub fn get_attribute(id: u32, out: &mut [u8]) -> Result<(), Error> {
    instance()?.attributes.get_attribute(id, out)
}
