// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker scheduler.
//!
//! A fixed set of worker threads, one per core of the node affinity (minus
//! one when the main thread is reused), each pinned to its core. Every worker
//! owns a local FIFO; tasks started from a worker land there first for cache
//! locality. `pick` tries the local FIFO, then the global per-priority FIFOs
//! highest-first, then steals from peers. Stolen or globally pulled entries
//! that fail the target action's affinity mask are handed back to the global
//! set.
//!
//! Waits entered from a worker thread never block the worker: they run this
//! same pick loop until the awaited condition holds (cooperative waiting),
//! which is what makes recursive task parallelism deadlock-free. Non-worker
//! threads block on a condition variable that completion paths signal.

use crate::action::ActionKind;
use crate::context::{ActionInput, ResultBuffer, TaskContext};
use crate::error::Error;
use crate::fifo::Fifo;
use crate::node::Node;
use crate::pool::Handle;
use crate::task::{self, TaskHandle, TaskState};
use crate::time::Deadline;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

std::thread_local! {
    /// `(scheduler epoch, worker index)` of the worker context owning this
    /// thread. Nested start/wait calls look the worker up here.
    static CURRENT_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Distinguishes worker registrations across finalize/initialize cycles.
static SCHEDULER_EPOCH: AtomicU64 = AtomicU64::new(0);

/// How long an idle worker sleeps before re-scanning the ready set.
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Cap on one condition-variable wait of a non-worker waiter.
const BLOCK_SLICE: Duration = Duration::from_millis(50);

pub(crate) struct Scheduler {
    epoch: u64,
    running: AtomicBool,
    /// Ready set, one FIFO per priority, index 0 is the highest priority.
    global: Box<[Fifo]>,
    workers: Box<[Worker]>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    idle: Mutex<()>,
    idle_cv: Condvar,
    done: Mutex<()>,
    done_cv: Condvar,
    reuse_main_thread: bool,
}

struct Worker {
    core: u32,
    local: Fifo,
}

impl Scheduler {
    pub(crate) fn new(
        max_priorities: u32,
        max_tasks: u32,
        cores: &[u32],
        reuse_main_thread: bool,
    ) -> Scheduler {
        let epoch = SCHEDULER_EPOCH.fetch_add(1, Ordering::Relaxed) + 1;
        let global = (0..max_priorities)
            .map(|_| Fifo::with_capacity(max_tasks as usize * 2))
            .collect();
        let workers = cores
            .iter()
            .map(|&core| Worker {
                core,
                local: Fifo::with_capacity(max_tasks as usize),
            })
            .collect();

        Scheduler {
            epoch,
            running: AtomicBool::new(false),
            global,
            workers,
            threads: Mutex::new(Vec::new()),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
            done: Mutex::new(()),
            done_cv: Condvar::new(),
            reuse_main_thread,
        }
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Spawns the worker threads. With main-thread reuse, worker 0 is the
    /// calling thread: it gets no OS thread and is registered via
    /// [`Scheduler::register_main_thread`] instead.
    pub(crate) fn start(&self, node: &Arc<Node>) -> Result<(), Error> {
        self.running.store(true, Ordering::Release);
        let first = usize::from(self.reuse_main_thread);

        let mut threads = self.threads.lock();
        for index in first..self.workers.len() {
            let node = Arc::clone(node);
            let spawned = thread::Builder::new()
                .name(format!("taskrt-worker-{index}"))
                .spawn(move || worker_main(&node, index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    tracing::error!(worker = index, error = %e, "failed to spawn worker");
                    return Err(Error::NodeInitFailed);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn register_main_thread(&self) {
        CURRENT_WORKER.with(|c| c.set(Some((self.epoch, 0))));
    }

    /// Stops and joins the workers. Queued tasks that never ran are dropped
    /// with the pools.
    pub(crate) fn shutdown(&self) {
        tracing::debug!("scheduler shutdown");
        self.running.store(false, Ordering::Release);
        {
            let _guard = self.idle.lock();
        }
        self.idle_cv.notify_all();
        self.notify_completion();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        CURRENT_WORKER.with(|c| {
            if matches!(c.get(), Some((epoch, _)) if epoch == self.epoch) {
                c.set(None);
            }
        });
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The calling thread's worker index, if it belongs to this scheduler.
    pub(crate) fn current_worker_index(&self) -> Option<usize> {
        CURRENT_WORKER
            .with(Cell::get)
            .and_then(|(epoch, index)| (epoch == self.epoch).then_some(index))
    }

    /// Publishes a ready task and wakes one idle worker. Tasks published from
    /// a worker go to its local FIFO first when `prefer_local` is set.
    pub(crate) fn publish(
        &self,
        _node: &Node,
        bits: u64,
        priority: u32,
        prefer_local: bool,
    ) -> bool {
        let pr = (priority as usize).min(self.global.len() - 1);
        let pushed = if prefer_local && self.current_worker_index().is_some() {
            let index = self.current_worker_index().expect("just checked");
            self.workers[index].local.push(bits) || self.global[pr].push(bits)
        } else {
            self.global[pr].push(bits)
        };

        if pushed {
            self.wake_one();
        }
        pushed
    }

    fn wake_one(&self) {
        let _guard = self.idle.lock();
        drop(_guard);
        self.idle_cv.notify_one();
    }

    pub(crate) fn notify_completion(&self) {
        {
            let _guard = self.done.lock();
        }
        self.done_cv.notify_all();
    }

    fn park(&self) {
        let mut guard = self.idle.lock();
        if !self.is_running() {
            return;
        }
        // the wait is bounded even though publishers notify: an entry whose
        // action no worker here may serve would otherwise spin the sweep
        self.idle_cv.wait_for(&mut guard, IDLE_PARK);
    }

    /// Picks and executes one ready task. Returns `false` when nothing was
    /// available for this worker.
    fn execute_one(&self, node: &Node, index: usize, rng: &mut fastrand::Rng) -> bool {
        let Some(bits) = self.pick(node, index, rng) else {
            return false;
        };
        self.execute(node, bits, index);
        true
    }

    fn pick(&self, node: &Node, index: usize, rng: &mut fastrand::Rng) -> Option<u64> {
        if let Some(bits) = self.workers[index].local.pop() {
            return Some(bits);
        }

        let core = self.workers[index].core;
        for fifo in &self.global {
            // one bounded pass so entries we hand back are not re-examined
            let mut attempts = fifo.len() + 1;
            while attempts > 0 {
                attempts -= 1;
                let Some(bits) = fifo.pop() else { break };
                if self.task_runs_on(node, bits, core) {
                    return Some(bits);
                }
                self.requeue_global(node, bits);
            }
        }

        self.steal(node, index, rng)
    }

    /// Steals from peer workers' local FIFOs, starting at a random victim.
    /// A stolen task that fails this worker's affinity is re-enqueued
    /// globally for a compatible worker.
    fn steal(&self, node: &Node, index: usize, rng: &mut fastrand::Rng) -> Option<u64> {
        let n = self.workers.len();
        if n <= 1 {
            return None;
        }
        let my_core = self.workers[index].core;
        let start = rng.usize(..n);

        for k in 0..n {
            let v = (start + k) % n;
            if v == index {
                continue;
            }
            let Some(bits) = self.workers[v].local.pop() else {
                continue;
            };
            if self.task_runs_on(node, bits, my_core) {
                tracing::trace!(victim = v, worker = index, "stole task");
                return Some(bits);
            }
            self.requeue_global(node, bits);
        }
        None
    }

    /// `true` when the task's action permits execution on `core` (stale
    /// entries pass so that the execute path can retire them).
    fn task_runs_on(&self, node: &Node, bits: u64, core: u32) -> bool {
        let Some(task) = node.tasks().resolve(Handle::from_bits(bits)) else {
            return true;
        };
        let Some(action) = node.actions().resolve(task.action) else {
            return true;
        };
        action.affinity().contains(core)
    }

    fn requeue_global(&self, node: &Node, bits: u64) {
        let priority = node
            .tasks()
            .resolve(Handle::from_bits(bits))
            .map_or(0, |t| t.attributes.priority);
        let pr = (priority as usize).min(self.global.len() - 1);
        while !self.global[pr].push(bits) {
            thread::yield_now();
        }
        self.wake_one();
    }

    /// Runs one entry of the ready set: claims an instance of the task (or
    /// retires a cancelled/stale one) and invokes the action.
    fn execute(&self, node: &Node, bits: u64, index: usize) {
        let handle = Handle::from_bits(bits);
        let Some(t) = node.tasks().resolve(handle) else {
            return;
        };

        if t.state() == TaskState::Cancelled {
            task::discard(node, handle);
            return;
        }

        let Some(action) = node.actions().resolve(t.action) else {
            t.record_error_if_unset(Error::ActionDeleted);
            t.cas_state(TaskState::Scheduled, TaskState::Cancelled);
            task::discard(node, handle);
            return;
        };
        if !action.is_enabled() {
            t.record_error_if_unset(action.takedown_error());
            t.cas_state(TaskState::Scheduled, TaskState::Cancelled);
            task::discard(node, handle);
            return;
        }

        let core = self.workers[index].core;
        if !action.affinity().contains(core) {
            self.requeue_global(node, bits);
            return;
        }

        // claim the task
        loop {
            match t.state() {
                TaskState::Scheduled => {
                    if t.cas_state(TaskState::Scheduled, TaskState::Running) {
                        break;
                    }
                }
                TaskState::Running => break,
                TaskState::Cancelled => {
                    task::discard(node, handle);
                    return;
                }
                // stale entries of earlier lifecycles
                TaskState::Created
                | TaskState::Retained
                | TaskState::Completed
                | TaskState::Error => return,
            }
        }

        match &action.kind {
            ActionKind::Plugin(plugin) => {
                tracing::trace!(task = ?handle, "plugin start");
                if let Err(e) = plugin.start(TaskHandle(handle)) {
                    t.record_error(e);
                    task::discard(node, handle);
                }
                // the plugin drives the task to completion; this worker is
                // free again
            }
            ActionKind::Local(body) => {
                let Some(instance) = t.claim_instance() else {
                    return;
                };
                if instance + 1 < t.num_instances() {
                    // more instances to hand out, republish for peers
                    self.requeue_global(node, bits);
                }

                let ctx = TaskContext::new(t, instance, t.num_instances(), core);
                let (result_ptr, result_len) = t.result_ptr();
                let result = ResultBuffer::new(result_ptr, result_len);
                let input = ActionInput {
                    args: t.args(),
                    result: &result,
                    node_local: &action.node_local,
                    ctx: &ctx,
                };

                tracing::trace!(task = ?handle, instance, "invoke");
                let run = body.as_ref();
                if catch_unwind(AssertUnwindSafe(|| run(input))).is_err() {
                    tracing::warn!(task = ?handle, instance, "action body panicked");
                    t.record_error(Error::ActionFailed);
                }

                if t.instances_done(1) {
                    task::finish(node, handle);
                }
            }
        }
    }

    /// Waits until `cond` holds. On a worker thread the wait is cooperative:
    /// the worker keeps executing ready tasks. Elsewhere it blocks on the
    /// completion condition variable in bounded slices.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the deadline expires first.
    pub(crate) fn wait_until(
        &self,
        node: &Node,
        deadline: Deadline,
        mut cond: impl FnMut() -> bool,
    ) -> Result<(), Error> {
        if cond() {
            return Ok(());
        }

        if let Some(index) = self.current_worker_index() {
            let mut rng = fastrand::Rng::with_seed(0x7ea5 ^ index as u64);
            loop {
                if cond() {
                    return Ok(());
                }
                if deadline.expired() {
                    return Err(Error::Timeout);
                }
                if !self.execute_one(node, index, &mut rng) {
                    thread::yield_now();
                }
            }
        } else {
            loop {
                if cond() {
                    return Ok(());
                }
                if deadline.expired() {
                    return Err(Error::Timeout);
                }
                let mut guard = self.done.lock();
                if cond() {
                    return Ok(());
                }
                let slice = deadline
                    .remaining_capped(BLOCK_SLICE)
                    .max(Duration::from_millis(1));
                let _ = self.done_cv.wait_for(&mut guard, slice);
            }
        }
    }

    /// One quantum of a hand-rolled wait loop: execute a ready task when on
    /// a worker, block for a bounded slice otherwise.
    pub(crate) fn run_or_block(&self, node: &Node, deadline: &Deadline) {
        if let Some(index) = self.current_worker_index() {
            let mut rng = fastrand::Rng::with_seed(0x51ed ^ index as u64);
            if !self.execute_one(node, index, &mut rng) {
                thread::yield_now();
            }
        } else {
            let mut guard = self.done.lock();
            let slice = deadline
                .remaining_capped(BLOCK_SLICE)
                .max(Duration::from_millis(1));
            let _ = self.done_cv.wait_for(&mut guard, slice);
        }
    }

    /// Scheduler-visible yield: run one ready task when called from a
    /// worker, yield the OS thread otherwise.
    pub(crate) fn yield_once(&self, node: &Node) {
        if let Some(index) = self.current_worker_index() {
            let mut rng = fastrand::Rng::with_seed(0x71e1d ^ index as u64);
            if !self.execute_one(node, index, &mut rng) {
                thread::yield_now();
            }
        } else {
            thread::yield_now();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .field("priorities", &self.global.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn worker_main(node: &Arc<Node>, index: usize) {
    let sched = node.scheduler();
    CURRENT_WORKER.with(|c| c.set(Some((sched.epoch, index))));

    let worker = &sched.workers[index];
    // worker cores are logical indices into the OS core list
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.get(worker.core as usize).copied())
        .is_some_and(core_affinity::set_for_current);

    let span = tracing::debug_span!("worker", worker = index, core = worker.core);
    let _entered = span.entered();
    tracing::debug!(pinned, "worker started");

    let mut rng = fastrand::Rng::with_seed(0x9e37_79b9 ^ index as u64);
    while sched.is_running() {
        if !sched.execute_one(node, index, &mut rng) {
            sched.park();
        }
    }

    tracing::debug!("stop signal received, shutting down");
    CURRENT_WORKER.with(|c| c.set(None));
}
