// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios against a live node.
//!
//! The node is a process-wide singleton, so every test takes the same lock
//! and runs its own initialize/finalize cycle.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use taskrt::attrs::{ActionAttributes, CoreAffinity, NodeAttributes};
use taskrt::task::TaskBuilder;
use taskrt::{action, group, job, node, plugin, queue};
use taskrt::{Error, PluginAction, QueueAttributes, TaskHandle, Timeout};

const DOMAIN: u32 = 1;
const JOB_SQUARE: u32 = 42;
const JOB_SPAWNER: u32 = 43;
const JOB_SLOW: u32 = 44;

fn node_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn with_node(attrs: NodeAttributes, f: impl FnOnce()) {
    let _guard = node_lock();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    node::initialize(DOMAIN, 0, attrs).unwrap();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(f));
    let _ = node::finalize();
    if let Err(payload) = outcome {
        std::panic::resume_unwind(payload);
    }
}

/// Registers the square action: result = args * args, both `u32`.
fn register_square() -> taskrt::ActionHandle {
    action::create(
        JOB_SQUARE,
        |input| {
            let x = u32::from_ne_bytes(input.args.try_into().unwrap());
            input.result.write(0, &(x * x).to_ne_bytes()).unwrap();
        },
        &[],
        ActionAttributes::new(),
    )
    .unwrap()
}

fn start_square(x: u32) -> TaskHandle {
    let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
    TaskBuilder::new()
        .args(x.to_ne_bytes())
        .result_capacity(4)
        .start(job)
        .unwrap()
}

#[test]
fn node_lifecycle() {
    let _guard = node_lock();

    assert_eq!(node::finalize(), Err(Error::NodeNotInit));
    assert_eq!(node::domain_id(), Err(Error::NodeNotInit));

    let info = node::initialize(DOMAIN, 7, NodeAttributes::new()).unwrap();
    assert!(info.num_workers >= 1);
    assert!(info.hardware_concurrency >= 1);

    assert_eq!(
        node::initialize(DOMAIN, 7, NodeAttributes::new()),
        Err(Error::NodeInitialized)
    );
    assert_eq!(node::domain_id(), Ok(DOMAIN));
    assert_eq!(node::node_id(), Ok(7));

    node::finalize().unwrap();
    assert!(!node::is_initialized());

    // re-initialization after finalize is permitted
    node::initialize(DOMAIN, 8, NodeAttributes::new()).unwrap();
    assert_eq!(node::node_id(), Ok(8));
    node::finalize().unwrap();
}

#[test]
fn square_task_round_trip() {
    with_node(NodeAttributes::new(), || {
        let act = register_square();

        let task = start_square(7);
        let result = task.wait(Timeout::INFINITE).unwrap();
        assert_eq!(u32::from_ne_bytes(result[..4].try_into().unwrap()), 49);

        // the slot was reclaimed by the successful wait
        assert_eq!(task.wait(Timeout::INFINITE), Err(Error::TaskInvalid));

        act.delete(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn group_wait_all_consumes_the_group() {
    with_node(NodeAttributes::new(), || {
        let _act = register_square();
        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();

        let grp = group::create(None, None).unwrap();
        for i in 0..10u32 {
            TaskBuilder::new()
                .args(i.to_ne_bytes())
                .result_capacity(4)
                .group(grp)
                .start(job)
                .unwrap();
        }

        grp.wait_all(Timeout::INFINITE).unwrap();
        // the group handle is no longer valid after a successful wait_all
        assert_eq!(grp.num_tasks(), Err(Error::GroupInvalid));
    });
}

#[test]
fn group_wait_any_returns_each_completion_once() {
    with_node(NodeAttributes::new(), || {
        let _act = register_square();
        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();

        let grp = group::create(None, None).unwrap();
        for i in 1..=3u32 {
            TaskBuilder::new()
                .args(i.to_ne_bytes())
                .result_capacity(4)
                .group(grp)
                .start(job)
                .unwrap();
        }

        let mut squares = Vec::new();
        for _ in 0..3 {
            let result = grp.wait_any(Timeout::INFINITE).unwrap();
            squares.push(u32::from_ne_bytes(result[..4].try_into().unwrap()));
        }
        squares.sort_unstable();
        assert_eq!(squares, vec![1, 4, 9]);

        // all completions consumed: the group reports completion and dies
        assert_eq!(grp.wait_any(Timeout::INFINITE), Err(Error::GroupCompleted));
        assert_eq!(grp.num_tasks(), Err(Error::GroupInvalid));
    });
}

#[test]
fn ordered_queue_runs_in_enqueue_order() {
    with_node(NodeAttributes::new(), || {
        let next = Arc::new(AtomicU32::new(0));
        let in_order = Arc::new(AtomicBool::new(true));

        let next_in_action = Arc::clone(&next);
        let in_order_in_action = Arc::clone(&in_order);
        let _act = action::create(
            JOB_SQUARE,
            move |input| {
                let index = u32::from_ne_bytes(input.args.try_into().unwrap());
                let seen = next_in_action.fetch_add(1, Ordering::SeqCst);
                if seen != index {
                    in_order_in_action.store(false, Ordering::SeqCst);
                }
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let q = queue::create(None, job, Some(QueueAttributes::new().ordered(true))).unwrap();
        let grp = group::create(None, None).unwrap();

        for i in 0..100u32 {
            TaskBuilder::new()
                .args(i.to_ne_bytes())
                .group(grp)
                .enqueue(q)
                .unwrap();
        }

        grp.wait_all(Timeout::INFINITE).unwrap();
        assert!(in_order.load(Ordering::SeqCst));
        assert_eq!(next.load(Ordering::SeqCst), 100);

        q.delete(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn recursive_spawn_does_not_starve_a_single_worker() {
    // one worker: the parent's wait must execute its children cooperatively
    let attrs = NodeAttributes::new().core_affinity(CoreAffinity::single(0).unwrap());
    with_node(attrs, || {
        let _square = register_square();

        let done = Arc::new(AtomicU32::new(0));
        let done_in_action = Arc::clone(&done);
        let _spawner = action::create(
            JOB_SPAWNER,
            move |_input| {
                let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
                for i in 0..100u32 {
                    let child = TaskBuilder::new()
                        .args(i.to_ne_bytes())
                        .result_capacity(4)
                        .start(job)
                        .unwrap();
                    let result = child.wait(Timeout::INFINITE).unwrap();
                    assert_eq!(
                        u32::from_ne_bytes(result[..4].try_into().unwrap()),
                        i * i
                    );
                    done_in_action.fetch_add(1, Ordering::SeqCst);
                }
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SPAWNER, DOMAIN).unwrap();
        let parent = TaskBuilder::new().start(job).unwrap();
        parent.wait(Timeout::INFINITE).unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 100);
    });
}

fn register_slow(release: &Arc<AtomicBool>) -> taskrt::ActionHandle {
    let release = Arc::clone(release);
    action::create(
        JOB_SLOW,
        move |_input| {
            while !release.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(10));
        },
        &[],
        ActionAttributes::new(),
    )
    .unwrap()
}

#[test]
fn action_disable_times_out_then_drains() {
    with_node(NodeAttributes::new(), || {
        let release = Arc::new(AtomicBool::new(false));
        let act = register_slow(&release);
        let job = job::get(JOB_SLOW, DOMAIN).unwrap();

        for _ in 0..50 {
            TaskBuilder::new().start(job).unwrap();
        }

        // tasks are gated on `release`, so a short disable must time out
        assert_eq!(act.disable(Timeout::from_millis(5)), Err(Error::Timeout));
        assert!(act.num_tasks().unwrap() > 0);

        release.store(true, Ordering::Release);
        act.disable(Timeout::INFINITE).unwrap();
        assert_eq!(act.num_tasks().unwrap(), 0);
    });
}

#[test]
fn wait_poll_times_out_on_unfinished_task() {
    with_node(NodeAttributes::new(), || {
        let release = Arc::new(AtomicBool::new(false));
        let _act = register_slow(&release);
        let job = job::get(JOB_SLOW, DOMAIN).unwrap();

        let task = TaskBuilder::new().start(job).unwrap();
        assert_eq!(task.wait(Timeout::POLL), Err(Error::Timeout));

        release.store(true, Ordering::Release);
        task.wait(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn task_pool_exhaustion() {
    let attrs = NodeAttributes::new().max_tasks(2);
    with_node(attrs, || {
        let release = Arc::new(AtomicBool::new(false));
        let _act = register_slow(&release);
        let job = job::get(JOB_SLOW, DOMAIN).unwrap();

        let a = TaskBuilder::new().start(job).unwrap();
        let b = TaskBuilder::new().start(job).unwrap();
        assert_eq!(TaskBuilder::new().start(job).unwrap_err(), Error::TaskLimit);

        release.store(true, Ordering::Release);
        a.wait(Timeout::INFINITE).unwrap();
        b.wait(Timeout::INFINITE).unwrap();

        // slots are reusable again
        let c = TaskBuilder::new().start(job).unwrap();
        c.wait(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn multi_instance_runs_each_instance_once() {
    with_node(NodeAttributes::new(), || {
        let _act = action::create(
            JOB_SQUARE,
            |input| {
                let i = input.ctx.instance_number();
                assert_eq!(input.ctx.num_instances(), 5);
                input
                    .result
                    .write(i as usize * 4, &i.to_ne_bytes())
                    .unwrap();
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let task = TaskBuilder::new()
            .instances(5)
            .result_capacity(20)
            .start(job)
            .unwrap();

        let result = task.wait(Timeout::INFINITE).unwrap();
        for i in 0..5u32 {
            let off = i as usize * 4;
            assert_eq!(
                u32::from_ne_bytes(result[off..off + 4].try_into().unwrap()),
                i
            );
        }
    });
}

#[test]
fn cancel_before_running() {
    let attrs = NodeAttributes::new().core_affinity(CoreAffinity::single(0).unwrap());
    with_node(attrs, || {
        let release = Arc::new(AtomicBool::new(false));
        let _slow = register_slow(&release);
        let slow_job = job::get(JOB_SLOW, DOMAIN).unwrap();

        // occupy the single worker, then cancel a task stuck behind it
        let blocker = TaskBuilder::new().start(slow_job).unwrap();
        let victim = TaskBuilder::new().start(slow_job).unwrap();

        victim.cancel().unwrap();
        assert_eq!(victim.wait(Timeout::INFINITE), Err(Error::ActionCancelled));

        release.store(true, Ordering::Release);
        blocker.wait(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn detached_tasks_reject_waiters() {
    with_node(NodeAttributes::new(), || {
        let _act = register_square();
        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();

        let task = TaskBuilder::new()
            .args(3u32.to_ne_bytes())
            .detached(true)
            .start(job)
            .unwrap();
        assert_eq!(task.wait(Timeout::INFINITE), Err(Error::TaskInvalid));

        // detached tasks cannot be grouped either
        let grp = group::create(None, None).unwrap();
        assert_eq!(
            TaskBuilder::new()
                .detached(true)
                .group(grp)
                .start(job)
                .unwrap_err(),
            Error::Parameter
        );
        grp.delete().unwrap();
    });
}

#[test]
fn disabled_queue_rejects_enqueues() {
    with_node(NodeAttributes::new(), || {
        let _act = register_square();
        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let q = queue::create(None, job, None).unwrap();

        q.disable(Timeout::INFINITE).unwrap();
        assert_eq!(
            TaskBuilder::new()
                .args(1u32.to_ne_bytes())
                .enqueue(q)
                .unwrap_err(),
            Error::QueueDisabled
        );

        q.enable().unwrap();
        let task = TaskBuilder::new()
            .args(2u32.to_ne_bytes())
            .result_capacity(4)
            .enqueue(q)
            .unwrap();
        let result = task.wait(Timeout::INFINITE).unwrap();
        assert_eq!(u32::from_ne_bytes(result[..4].try_into().unwrap()), 4);

        q.delete(Timeout::INFINITE).unwrap();
        assert_eq!(q.num_tasks(), Err(Error::QueueInvalid));
    });
}

#[test]
fn queue_retains_backlog_across_disable() {
    let attrs = NodeAttributes::new().core_affinity(CoreAffinity::single(0).unwrap());
    with_node(attrs, || {
        let ran = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));

        let ran_in_action = Arc::clone(&ran);
        let release_in_action = Arc::clone(&release);
        let _act = action::create(
            JOB_SLOW,
            move |_input| {
                while !release_in_action.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                ran_in_action.fetch_add(1, Ordering::SeqCst);
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SLOW, DOMAIN).unwrap();
        let q = queue::create(
            None,
            job,
            Some(QueueAttributes::new().ordered(true).retain(true)),
        )
        .unwrap();
        let grp = group::create(None, None).unwrap();

        for _ in 0..6 {
            TaskBuilder::new().group(grp).enqueue(q).unwrap();
        }

        // the head task is wedged on `release`
        assert_eq!(q.disable(Timeout::from_millis(5)), Err(Error::Timeout));
        release.store(true, Ordering::Release);
        q.disable(Timeout::INFINITE).unwrap();

        // backlog survived the disable and resumes on enable
        assert!(q.num_tasks().unwrap() > 0);
        q.enable().unwrap();

        grp.wait_all(Timeout::INFINITE).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 6);

        q.delete(Timeout::INFINITE).unwrap();
    });
}

#[test]
fn second_local_action_for_a_job_is_rejected() {
    with_node(NodeAttributes::new(), || {
        let _a = register_square();
        let result = action::create(JOB_SQUARE, |_input| {}, &[], ActionAttributes::new());
        assert_eq!(result.unwrap_err(), Error::ActionExists);
    });
}

#[test]
fn invalid_handles_and_jobs() {
    with_node(NodeAttributes::new(), || {
        assert_eq!(job::get(100_000, DOMAIN).unwrap_err(), Error::JobInvalid);
        assert_eq!(job::get(JOB_SQUARE, DOMAIN + 1).unwrap_err(), Error::JobInvalid);

        // a job with no registered actions refuses starts
        let empty = job::get(17, DOMAIN).unwrap();
        assert_eq!(
            TaskBuilder::new().start(empty).unwrap_err(),
            Error::JobInvalid
        );
    });
}

#[test]
fn action_errors_surface_through_wait() {
    with_node(NodeAttributes::new(), || {
        let _act = action::create(
            JOB_SQUARE,
            |input| {
                input.ctx.set_status(Error::ActionFailed).unwrap();
            },
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let task = TaskBuilder::new().start(job).unwrap();
        assert_eq!(task.wait(Timeout::INFINITE), Err(Error::ActionFailed));
    });
}

#[test]
fn deleting_a_group_with_outstanding_tasks_reclaims_their_slots() {
    let attrs = NodeAttributes::new().max_tasks(4);
    with_node(attrs, || {
        let release = Arc::new(AtomicBool::new(false));
        let act = register_slow(&release);
        let job = job::get(JOB_SLOW, DOMAIN).unwrap();

        let grp = group::create(None, None).unwrap();
        for _ in 0..4 {
            TaskBuilder::new().group(grp).start(job).unwrap();
        }
        // the group dies with all members still outstanding; their
        // completions have no consumer left
        grp.delete().unwrap();

        release.store(true, Ordering::Release);
        while act.num_tasks().unwrap() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        // every slot must come back; a leak would pin the pool at capacity
        for _ in 0..4 {
            let mut attempts = 0;
            let task = loop {
                match TaskBuilder::new().start(job) {
                    Ok(task) => break task,
                    Err(Error::TaskLimit) if attempts < 1_000 => {
                        attempts += 1;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => panic!("start failed: {e}"),
                }
            };
            task.wait(Timeout::INFINITE).unwrap();
        }
    });
}

#[test]
fn reuse_main_thread_executes_in_waits() {
    // the initializing thread doubles as worker 0: even with no other
    // worker, its waits must drive tasks to completion
    let attrs = NodeAttributes::new()
        .core_affinity(CoreAffinity::single(0).unwrap())
        .reuse_main_thread(true);
    with_node(attrs, || {
        let _act = register_square();
        let task = start_square(6);
        let result = task.wait(Timeout::INFINITE).unwrap();
        assert_eq!(u32::from_ne_bytes(result[..4].try_into().unwrap()), 36);
    });
}

struct FailingPlugin {
    finalized: Arc<AtomicBool>,
}

impl PluginAction for FailingPlugin {
    fn start(&self, task: TaskHandle) -> Result<(), Error> {
        // complete immediately with a failure, like a device rejecting work
        plugin::task_complete(task, Err(Error::ActionFailed), None)
    }

    fn cancel(&self, _task: TaskHandle) -> Result<(), Error> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), Error> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}

#[test]
fn plugin_action_drives_completion() {
    with_node(NodeAttributes::new(), || {
        let finalized = Arc::new(AtomicBool::new(false));
        let act = plugin::create(
            JOB_SQUARE,
            Arc::new(FailingPlugin {
                finalized: Arc::clone(&finalized),
            }),
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let task = TaskBuilder::new().start(job).unwrap();
        assert_eq!(task.wait(Timeout::INFINITE), Err(Error::ActionFailed));

        act.delete(Timeout::INFINITE).unwrap();
        assert!(finalized.load(Ordering::Acquire));
    });
}

struct EchoPlugin;

impl PluginAction for EchoPlugin {
    fn start(&self, task: TaskHandle) -> Result<(), Error> {
        let args = plugin::with_task_args(task, <[u8]>::to_vec)?;
        plugin::task_complete(task, Ok(()), Some(&args))
    }

    fn cancel(&self, _task: TaskHandle) -> Result<(), Error> {
        Ok(())
    }

    fn finalize(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[test]
fn plugin_action_returns_results() {
    with_node(NodeAttributes::new(), || {
        let _act = plugin::create(
            JOB_SQUARE,
            Arc::new(EchoPlugin),
            &[],
            ActionAttributes::new(),
        )
        .unwrap();

        let job = job::get(JOB_SQUARE, DOMAIN).unwrap();
        let task = TaskBuilder::new()
            .args([1, 2, 3, 4])
            .result_capacity(4)
            .start(job)
            .unwrap();
        let result = task.wait(Timeout::INFINITE).unwrap();
        assert_eq!(&result[..], &[1, 2, 3, 4]);
    });
}
