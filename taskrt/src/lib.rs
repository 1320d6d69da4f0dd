// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multicore task-parallel runtime.
//!
//! `taskrt` schedules fine-grained computations, *tasks*, onto a bounded
//! pool of worker threads pinned to cores, and routes them to heterogeneous
//! *actions*: local functions or plugin-driven executors (GPU dispatchers,
//! network endpoints). Tasks can be joined individually, collected in
//! *groups* (wait-any / wait-all), or serialized through ordered *queues*.
//!
//! The scheduler is lock-free on its hot paths: tag-versioned handle pools,
//! per-priority MPMC ready queues, per-worker local queues with work
//! stealing. Waits entered from worker threads are *cooperative*: the
//! worker keeps executing other ready tasks, so a parent task waiting on its
//! children never ties up its thread.
//!
//! ```no_run
//! use taskrt::attrs::{ActionAttributes, NodeAttributes};
//! use taskrt::task::TaskBuilder;
//! use taskrt::{node, action, job, Timeout};
//!
//! node::initialize(1, 0, NodeAttributes::new()).unwrap();
//!
//! let _square = action::create(
//!     42,
//!     |input| {
//!         let x = u32::from_ne_bytes(input.args.try_into().unwrap());
//!         input.result.write(0, &(x * x).to_ne_bytes()).unwrap();
//!     },
//!     &[],
//!     ActionAttributes::new(),
//! )
//! .unwrap();
//!
//! let job = job::get(42, 1).unwrap();
//! let task = TaskBuilder::new()
//!     .args(7u32.to_ne_bytes())
//!     .result_capacity(4)
//!     .start(job)
//!     .unwrap();
//!
//! let result = task.wait(Timeout::INFINITE).unwrap();
//! assert_eq!(u32::from_ne_bytes(result[..4].try_into().unwrap()), 49);
//!
//! node::finalize().unwrap();
//! ```

pub mod action;
pub mod attrs;
pub mod context;
mod error;
mod fifo;
pub mod group;
pub mod job;
mod loom;
pub mod node;
pub mod plugin;
mod pool;
pub mod queue;
mod scheduler;
pub mod task;
mod time;

pub use error::Error;
pub use time::Timeout;

pub use action::{ActionFunction, ActionHandle};
pub use attrs::{
    ActionAttributes, CoreAffinity, GroupAttributes, NodeAttributes, QueueAttributes,
    TaskAttributes,
};
pub use context::{ActionInput, ResultBuffer, TaskContext};
pub use group::GroupHandle;
pub use job::JobHandle;
pub use node::NodeInfo;
pub use plugin::PluginAction;
pub use queue::QueueHandle;
pub use task::{TaskBuilder, TaskHandle, TaskState};

/// Domain identifier; one node serves one domain.
pub type DomainId = u32;
/// Node identifier within a domain.
pub type NodeId = u32;
/// Logical operation identifier routed through the job table.
pub type JobId = u32;
/// Client-chosen task identifier, informational.
pub type TaskId = u32;
/// Client-chosen group identifier, informational.
pub type GroupId = u32;
/// Client-chosen queue identifier, informational.
pub type QueueId = u32;

use static_assertions::assert_impl_all;

assert_impl_all!(TaskHandle: Send, Sync, Copy);
assert_impl_all!(ActionHandle: Send, Sync, Copy);
assert_impl_all!(GroupHandle: Send, Sync, Copy);
assert_impl_all!(QueueHandle: Send, Sync, Copy);
assert_impl_all!(JobHandle: Send, Sync, Copy);
assert_impl_all!(Error: Send, Sync, Copy);
