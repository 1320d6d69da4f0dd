// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Attribute bags for nodes, actions, tasks, groups and queues.
//!
//! Each entity kind exposes a closed set of numeric attribute ids plus a raw
//! byte-oriented `set_attribute`/`get_attribute` pair with size validation,
//! and typed builder methods for direct configuration. Integral values travel
//! as native-endian words; booleans as a `u32` that must be 0 or 1.

use crate::error::Error;
use core::fmt;

/// A set of core numbers, one bit per core.
///
/// Used both as the node attribute selecting which cores receive worker
/// threads and as the per-action mask restricting which workers may execute
/// the action.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreAffinity(u64);

impl CoreAffinity {
    pub const MAX_CORES: u32 = 64;

    /// Every core the machine offers.
    #[must_use]
    pub const fn all() -> CoreAffinity {
        CoreAffinity(u64::MAX)
    }

    #[must_use]
    pub const fn none() -> CoreAffinity {
        CoreAffinity(0)
    }

    /// # Errors
    ///
    /// [`Error::Parameter`] if `core` is not below [`Self::MAX_CORES`].
    pub fn single(core: u32) -> Result<CoreAffinity, Error> {
        let mut a = CoreAffinity::none();
        a.set(core, true)?;
        Ok(a)
    }

    /// # Errors
    ///
    /// [`Error::Parameter`] if `core` is not below [`Self::MAX_CORES`].
    pub fn set(&mut self, core: u32, enabled: bool) -> Result<(), Error> {
        if core >= Self::MAX_CORES {
            return Err(Error::Parameter);
        }
        if enabled {
            self.0 |= 1 << core;
        } else {
            self.0 &= !(1 << core);
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, core: u32) -> bool {
        core < Self::MAX_CORES && self.0 & (1 << core) != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..Self::MAX_CORES).filter(move |c| self.contains(*c))
    }

    pub(crate) fn bits(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_bits(bits: u64) -> CoreAffinity {
        CoreAffinity(bits)
    }

    /// Intersection with the cores actually present, `0..num_cores`.
    pub(crate) fn clamp_to(&self, num_cores: u32) -> CoreAffinity {
        let mask = if num_cores >= Self::MAX_CORES {
            u64::MAX
        } else {
            (1u64 << num_cores) - 1
        };
        CoreAffinity(self.0 & mask)
    }
}

impl fmt::Debug for CoreAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreAffinity({:#x})", self.0)
    }
}

// --- raw value plumbing ---

fn get_u32(value: u32, out: &mut [u8]) -> Result<(), Error> {
    if out.len() != 4 {
        return Err(Error::AttrSize);
    }
    out.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn parse_u32(bytes: &[u8]) -> Result<u32, Error> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| Error::AttrSize)?;
    Ok(u32::from_ne_bytes(arr))
}

fn get_u64(value: u64, out: &mut [u8]) -> Result<(), Error> {
    if out.len() != 8 {
        return Err(Error::AttrSize);
    }
    out.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn parse_u64(bytes: &[u8]) -> Result<u64, Error> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::AttrSize)?;
    Ok(u64::from_ne_bytes(arr))
}

fn get_bool(value: bool, out: &mut [u8]) -> Result<(), Error> {
    get_u32(u32::from(value), out)
}

fn parse_bool(bytes: &[u8]) -> Result<bool, Error> {
    match parse_u32(bytes)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::Parameter),
    }
}

fn parse_nonzero_u32(bytes: &[u8]) -> Result<u32, Error> {
    match parse_u32(bytes)? {
        0 => Err(Error::Parameter),
        n => Ok(n),
    }
}

// --- node ---

/// Node attribute ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeAttr {
    CoreAffinity = 0,
    NumCores = 1,
    MaxTasks = 2,
    MaxActions = 3,
    MaxGroups = 4,
    MaxQueues = 5,
    QueueLimit = 6,
    MaxJobs = 7,
    MaxActionsPerJob = 8,
    MaxPriorities = 9,
    ReuseMainThread = 10,
}

impl NodeAttr {
    fn from_raw(id: u32) -> Result<NodeAttr, Error> {
        match id {
            0 => Ok(NodeAttr::CoreAffinity),
            1 => Ok(NodeAttr::NumCores),
            2 => Ok(NodeAttr::MaxTasks),
            3 => Ok(NodeAttr::MaxActions),
            4 => Ok(NodeAttr::MaxGroups),
            5 => Ok(NodeAttr::MaxQueues),
            6 => Ok(NodeAttr::QueueLimit),
            7 => Ok(NodeAttr::MaxJobs),
            8 => Ok(NodeAttr::MaxActionsPerJob),
            9 => Ok(NodeAttr::MaxPriorities),
            10 => Ok(NodeAttr::ReuseMainThread),
            _ => Err(Error::AttrNum),
        }
    }
}

/// Immutable node configuration, fixed at [`initialize`].
///
/// [`initialize`]: crate::node::initialize
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAttributes {
    pub(crate) core_affinity: CoreAffinity,
    /// Filled in by node initialization; read-only to clients.
    pub(crate) num_cores: u32,
    pub(crate) max_tasks: u32,
    pub(crate) max_actions: u32,
    pub(crate) max_groups: u32,
    pub(crate) max_queues: u32,
    pub(crate) queue_limit: u32,
    pub(crate) max_jobs: u32,
    pub(crate) max_actions_per_job: u32,
    pub(crate) max_priorities: u32,
    pub(crate) reuse_main_thread: bool,
}

impl Default for NodeAttributes {
    fn default() -> Self {
        NodeAttributes {
            core_affinity: CoreAffinity::all(),
            num_cores: 0,
            max_tasks: 1024,
            max_actions: 64,
            max_groups: 64,
            max_queues: 16,
            queue_limit: 1024,
            max_jobs: 256,
            max_actions_per_job: 4,
            max_priorities: 4,
            reuse_main_thread: false,
        }
    }
}

impl NodeAttributes {
    #[must_use]
    pub fn new() -> NodeAttributes {
        NodeAttributes::default()
    }

    #[must_use]
    pub fn core_affinity(mut self, affinity: CoreAffinity) -> Self {
        self.core_affinity = affinity;
        self
    }

    #[must_use]
    pub fn max_tasks(mut self, n: u32) -> Self {
        self.max_tasks = n;
        self
    }

    #[must_use]
    pub fn max_actions(mut self, n: u32) -> Self {
        self.max_actions = n;
        self
    }

    #[must_use]
    pub fn max_groups(mut self, n: u32) -> Self {
        self.max_groups = n;
        self
    }

    #[must_use]
    pub fn max_queues(mut self, n: u32) -> Self {
        self.max_queues = n;
        self
    }

    #[must_use]
    pub fn queue_limit(mut self, n: u32) -> Self {
        self.queue_limit = n;
        self
    }

    #[must_use]
    pub fn max_jobs(mut self, n: u32) -> Self {
        self.max_jobs = n;
        self
    }

    #[must_use]
    pub fn max_actions_per_job(mut self, n: u32) -> Self {
        self.max_actions_per_job = n;
        self
    }

    #[must_use]
    pub fn max_priorities(mut self, n: u32) -> Self {
        self.max_priorities = n;
        self
    }

    #[must_use]
    pub fn reuse_main_thread(mut self, reuse: bool) -> Self {
        self.reuse_main_thread = reuse;
        self
    }

    /// Raw attribute write with size validation.
    ///
    /// # Errors
    ///
    /// [`Error::AttrNum`] for an unknown id, [`Error::AttrSize`] for a size
    /// mismatch, [`Error::Parameter`] for an out-of-range value and
    /// [`Error::AttrReadonly`] for [`NodeAttr::NumCores`].
    pub fn set_attribute(&mut self, id: u32, value: &[u8]) -> Result<(), Error> {
        match NodeAttr::from_raw(id)? {
            NodeAttr::CoreAffinity => {
                let affinity = CoreAffinity::from_bits(parse_u64(value)?);
                if affinity.is_empty() {
                    return Err(Error::Parameter);
                }
                self.core_affinity = affinity;
            }
            NodeAttr::NumCores => return Err(Error::AttrReadonly),
            NodeAttr::MaxTasks => self.max_tasks = parse_nonzero_u32(value)?,
            NodeAttr::MaxActions => self.max_actions = parse_nonzero_u32(value)?,
            NodeAttr::MaxGroups => self.max_groups = parse_nonzero_u32(value)?,
            NodeAttr::MaxQueues => self.max_queues = parse_nonzero_u32(value)?,
            NodeAttr::QueueLimit => self.queue_limit = parse_nonzero_u32(value)?,
            NodeAttr::MaxJobs => self.max_jobs = parse_nonzero_u32(value)?,
            NodeAttr::MaxActionsPerJob => self.max_actions_per_job = parse_nonzero_u32(value)?,
            NodeAttr::MaxPriorities => self.max_priorities = parse_nonzero_u32(value)?,
            NodeAttr::ReuseMainThread => self.reuse_main_thread = parse_bool(value)?,
        }
        Ok(())
    }

    /// Small-value fast path: integral attributes passed by value.
    ///
    /// # Errors
    ///
    /// As [`NodeAttributes::set_attribute`].
    pub fn set_attribute_value(&mut self, id: u32, value: u64) -> Result<(), Error> {
        match NodeAttr::from_raw(id)? {
            NodeAttr::CoreAffinity => self.set_attribute(id, &value.to_ne_bytes()),
            NodeAttr::ReuseMainThread => {
                let v = u32::try_from(value).map_err(|_| Error::Parameter)?;
                self.set_attribute(id, &v.to_ne_bytes())
            }
            _ => {
                let v = u32::try_from(value).map_err(|_| Error::Parameter)?;
                self.set_attribute(id, &v.to_ne_bytes())
            }
        }
    }

    /// Raw attribute read with size validation.
    ///
    /// # Errors
    ///
    /// [`Error::AttrNum`] for an unknown id, [`Error::AttrSize`] for a size
    /// mismatch.
    pub fn get_attribute(&self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        match NodeAttr::from_raw(id)? {
            NodeAttr::CoreAffinity => get_u64(self.core_affinity.bits(), out),
            NodeAttr::NumCores => get_u32(self.num_cores, out),
            NodeAttr::MaxTasks => get_u32(self.max_tasks, out),
            NodeAttr::MaxActions => get_u32(self.max_actions, out),
            NodeAttr::MaxGroups => get_u32(self.max_groups, out),
            NodeAttr::MaxQueues => get_u32(self.max_queues, out),
            NodeAttr::QueueLimit => get_u32(self.queue_limit, out),
            NodeAttr::MaxJobs => get_u32(self.max_jobs, out),
            NodeAttr::MaxActionsPerJob => get_u32(self.max_actions_per_job, out),
            NodeAttr::MaxPriorities => get_u32(self.max_priorities, out),
            NodeAttr::ReuseMainThread => get_bool(self.reuse_main_thread, out),
        }
    }
}

// --- action ---

/// Action attribute ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ActionAttr {
    Global = 0,
    Affinity = 1,
    DomainShared = 2,
}

impl ActionAttr {
    fn from_raw(id: u32) -> Result<ActionAttr, Error> {
        match id {
            0 => Ok(ActionAttr::Global),
            1 => Ok(ActionAttr::Affinity),
            2 => Ok(ActionAttr::DomainShared),
            _ => Err(Error::AttrNum),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionAttributes {
    pub(crate) global: bool,
    pub(crate) affinity: CoreAffinity,
    pub(crate) domain_shared: bool,
}

impl Default for ActionAttributes {
    fn default() -> Self {
        ActionAttributes {
            global: true,
            affinity: CoreAffinity::all(),
            domain_shared: false,
        }
    }
}

impl ActionAttributes {
    #[must_use]
    pub fn new() -> ActionAttributes {
        ActionAttributes::default()
    }

    #[must_use]
    pub fn affinity(mut self, affinity: CoreAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    #[must_use]
    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    #[must_use]
    pub fn domain_shared(mut self, shared: bool) -> Self {
        self.domain_shared = shared;
        self
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`], [`Error::AttrSize`] or [`Error::Parameter`] as for
    /// [`NodeAttributes::set_attribute`].
    pub fn set_attribute(&mut self, id: u32, value: &[u8]) -> Result<(), Error> {
        match ActionAttr::from_raw(id)? {
            ActionAttr::Global => self.global = parse_bool(value)?,
            ActionAttr::Affinity => self.affinity = CoreAffinity::from_bits(parse_u64(value)?),
            ActionAttr::DomainShared => self.domain_shared = parse_bool(value)?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(&self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        match ActionAttr::from_raw(id)? {
            ActionAttr::Global => get_bool(self.global, out),
            ActionAttr::Affinity => get_u64(self.affinity.bits(), out),
            ActionAttr::DomainShared => get_bool(self.domain_shared, out),
        }
    }
}

// --- task ---

/// Task attribute ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskAttr {
    Detached = 0,
    Instances = 1,
    Priority = 2,
}

impl TaskAttr {
    fn from_raw(id: u32) -> Result<TaskAttr, Error> {
        match id {
            0 => Ok(TaskAttr::Detached),
            1 => Ok(TaskAttr::Instances),
            2 => Ok(TaskAttr::Priority),
            _ => Err(Error::AttrNum),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskAttributes {
    pub(crate) detached: bool,
    pub(crate) instances: u32,
    pub(crate) priority: u32,
}

impl Default for TaskAttributes {
    fn default() -> Self {
        TaskAttributes {
            detached: false,
            instances: 1,
            priority: 0,
        }
    }
}

impl TaskAttributes {
    #[must_use]
    pub fn new() -> TaskAttributes {
        TaskAttributes::default()
    }

    #[must_use]
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    #[must_use]
    pub fn instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`], [`Error::AttrSize`] or [`Error::Parameter`].
    pub fn set_attribute(&mut self, id: u32, value: &[u8]) -> Result<(), Error> {
        match TaskAttr::from_raw(id)? {
            TaskAttr::Detached => self.detached = parse_bool(value)?,
            TaskAttr::Instances => self.instances = parse_nonzero_u32(value)?,
            TaskAttr::Priority => self.priority = parse_u32(value)?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(&self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        match TaskAttr::from_raw(id)? {
            TaskAttr::Detached => get_bool(self.detached, out),
            TaskAttr::Instances => get_u32(self.instances, out),
            TaskAttr::Priority => get_u32(self.priority, out),
        }
    }
}

// --- group ---

/// Groups currently define no attributes; the bag exists for interface
/// symmetry and future ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupAttributes {}

impl GroupAttributes {
    #[must_use]
    pub fn new() -> GroupAttributes {
        GroupAttributes::default()
    }

    /// # Errors
    ///
    /// Always [`Error::AttrNum`].
    pub fn set_attribute(&mut self, _id: u32, _value: &[u8]) -> Result<(), Error> {
        Err(Error::AttrNum)
    }

    /// # Errors
    ///
    /// Always [`Error::AttrNum`].
    pub fn get_attribute(&self, _id: u32, _out: &mut [u8]) -> Result<(), Error> {
        Err(Error::AttrNum)
    }
}

// --- queue ---

/// Queue attribute ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueAttr {
    Global = 0,
    Ordered = 1,
    Retain = 2,
    DomainShared = 3,
    Priority = 4,
}

impl QueueAttr {
    fn from_raw(id: u32) -> Result<QueueAttr, Error> {
        match id {
            0 => Ok(QueueAttr::Global),
            1 => Ok(QueueAttr::Ordered),
            2 => Ok(QueueAttr::Retain),
            3 => Ok(QueueAttr::DomainShared),
            4 => Ok(QueueAttr::Priority),
            _ => Err(Error::AttrNum),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueAttributes {
    pub(crate) global: bool,
    pub(crate) ordered: bool,
    pub(crate) retain: bool,
    pub(crate) domain_shared: bool,
    pub(crate) priority: u32,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        QueueAttributes {
            global: true,
            ordered: true,
            retain: false,
            domain_shared: false,
            priority: 0,
        }
    }
}

impl QueueAttributes {
    #[must_use]
    pub fn new() -> QueueAttributes {
        QueueAttributes::default()
    }

    #[must_use]
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    #[must_use]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    #[must_use]
    pub fn domain_shared(mut self, shared: bool) -> Self {
        self.domain_shared = shared;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`], [`Error::AttrSize`] or [`Error::Parameter`].
    pub fn set_attribute(&mut self, id: u32, value: &[u8]) -> Result<(), Error> {
        match QueueAttr::from_raw(id)? {
            QueueAttr::Global => self.global = parse_bool(value)?,
            QueueAttr::Ordered => self.ordered = parse_bool(value)?,
            QueueAttr::Retain => self.retain = parse_bool(value)?,
            QueueAttr::DomainShared => self.domain_shared = parse_bool(value)?,
            QueueAttr::Priority => self.priority = parse_u32(value)?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`Error::AttrNum`] or [`Error::AttrSize`].
    pub fn get_attribute(&self, id: u32, out: &mut [u8]) -> Result<(), Error> {
        match QueueAttr::from_raw(id)? {
            QueueAttr::Global => get_bool(self.global, out),
            QueueAttr::Ordered => get_bool(self.ordered, out),
            QueueAttr::Retain => get_bool(self.retain, out),
            QueueAttr::DomainShared => get_bool(self.domain_shared, out),
            QueueAttr::Priority => get_u32(self.priority, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_attribute_id() {
        let mut attrs = NodeAttributes::new();
        assert_eq!(
            attrs.set_attribute(99, &1u32.to_ne_bytes()),
            Err(Error::AttrNum)
        );
        let mut out = [0u8; 4];
        assert_eq!(attrs.get_attribute(99, &mut out), Err(Error::AttrNum));
    }

    #[test]
    fn size_mismatch() {
        let mut attrs = NodeAttributes::new();
        assert_eq!(
            attrs.set_attribute(NodeAttr::MaxTasks as u32, &[0u8; 3]),
            Err(Error::AttrSize)
        );
        let mut out = [0u8; 2];
        assert_eq!(
            attrs.get_attribute(NodeAttr::MaxTasks as u32, &mut out),
            Err(Error::AttrSize)
        );
    }

    #[test]
    fn readonly_attribute() {
        let mut attrs = NodeAttributes::new();
        assert_eq!(
            attrs.set_attribute(NodeAttr::NumCores as u32, &4u32.to_ne_bytes()),
            Err(Error::AttrReadonly)
        );
    }

    #[test]
    fn out_of_range_values() {
        let mut attrs = NodeAttributes::new();
        assert_eq!(
            attrs.set_attribute(NodeAttr::MaxTasks as u32, &0u32.to_ne_bytes()),
            Err(Error::Parameter)
        );
        assert_eq!(
            attrs.set_attribute(NodeAttr::ReuseMainThread as u32, &2u32.to_ne_bytes()),
            Err(Error::Parameter)
        );
        assert_eq!(
            attrs.set_attribute(NodeAttr::CoreAffinity as u32, &0u64.to_ne_bytes()),
            Err(Error::Parameter)
        );
    }

    #[test]
    fn round_trip_values() {
        let mut attrs = NodeAttributes::new();
        attrs
            .set_attribute(NodeAttr::MaxPriorities as u32, &7u32.to_ne_bytes())
            .unwrap();
        let mut out = [0u8; 4];
        attrs
            .get_attribute(NodeAttr::MaxPriorities as u32, &mut out)
            .unwrap();
        assert_eq!(u32::from_ne_bytes(out), 7);
    }

    #[test]
    fn fast_path_value() {
        let mut attrs = TaskAttributes::new();
        attrs.set_attribute(TaskAttr::Instances as u32, &5u32.to_ne_bytes()).unwrap();
        assert_eq!(attrs.instances, 5);
        assert_eq!(
            attrs.set_attribute(TaskAttr::Instances as u32, &0u32.to_ne_bytes()),
            Err(Error::Parameter)
        );
    }

    #[test]
    fn affinity_set_operations() {
        let mut a = CoreAffinity::none();
        assert!(a.is_empty());
        a.set(0, true).unwrap();
        a.set(3, true).unwrap();
        assert!(a.contains(0));
        assert!(!a.contains(1));
        assert_eq!(a.count(), 2);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(a.set(64, true), Err(Error::Parameter));

        let clamped = CoreAffinity::all().clamp_to(4);
        assert_eq!(clamped.count(), 4);
    }

    #[test]
    fn group_attributes_have_no_ids() {
        let mut g = GroupAttributes::new();
        assert_eq!(g.set_attribute(0, &[]), Err(Error::AttrNum));
    }

    #[test]
    fn node_attribute_value_fast_path() {
        let mut attrs = NodeAttributes::new();
        attrs
            .set_attribute_value(NodeAttr::MaxTasks as u32, 64)
            .unwrap();
        assert_eq!(attrs.max_tasks, 64);
        attrs
            .set_attribute_value(NodeAttr::ReuseMainThread as u32, 1)
            .unwrap();
        assert!(attrs.reuse_main_thread);
    }
}
