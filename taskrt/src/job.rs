// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The job table: per-domain routing from job ids to implementing actions.
//!
//! A job is a pure routing record. Its action list is a fixed array of packed
//! action handles; reads take an atomic snapshot of the length and walk the
//! entries lock-free, writes (action create/delete) are serialized by a
//! short-held per-job lock.

use crate::error::Error;
use crate::node;
use crate::pool::Handle;
use crate::{DomainId, JobId};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use parking_lot::Mutex;

/// Handle to a `(domain, job)` routing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub(crate) id: JobId,
}

impl JobHandle {
    /// The job id this handle routes to.
    #[must_use]
    pub fn id(self) -> JobId {
        self.id
    }
}

/// Looks up the routing entry for `(job_id, domain_id)`.
///
/// # Errors
///
/// [`Error::NodeNotInit`] before initialization, [`Error::JobInvalid`] when
/// `job_id` is out of range or `domain_id` is not this node's domain.
pub fn get(job_id: JobId, domain_id: DomainId) -> Result<JobHandle, Error> {
    let node = node::instance()?;
    if domain_id != node.domain_id() {
        return Err(Error::JobInvalid);
    }
    if job_id >= node.attributes().max_jobs {
        return Err(Error::JobInvalid);
    }
    Ok(JobHandle { id: job_id })
}

pub(crate) struct Job {
    /// Packed action handles; entries beyond `num_actions` are garbage.
    actions: Box<[AtomicU64]>,
    num_actions: AtomicU32,
    round_robin: AtomicU32,
    write_lock: Mutex<()>,
}

impl Job {
    fn with_capacity(capacity: u32) -> Job {
        Job {
            actions: (0..capacity)
                .map(|_| AtomicU64::new(Handle::INVALID.into_bits()))
                .collect(),
            num_actions: AtomicU32::new(0),
            round_robin: AtomicU32::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends an action to the routing list.
    ///
    /// # Errors
    ///
    /// [`Error::ActionLimit`] when the per-job list is full.
    pub(crate) fn add_action(&self, action: Handle) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let n = self.num_actions.load(Ordering::Relaxed) as usize;
        if n == self.actions.len() {
            return Err(Error::ActionLimit);
        }
        self.actions[n].store(action.into_bits(), Ordering::Release);
        self.num_actions
            .store(u32::try_from(n + 1).expect("list fits in u32"), Ordering::Release);
        Ok(())
    }

    /// Removes an action by swapping it with the last list entry.
    pub(crate) fn remove_action(&self, action: Handle) {
        let _guard = self.write_lock.lock();
        let n = self.num_actions.load(Ordering::Relaxed) as usize;
        let bits = action.into_bits();
        for i in 0..n {
            if self.actions[i].load(Ordering::Relaxed) == bits {
                let last = self.actions[n - 1].load(Ordering::Relaxed);
                self.actions[i].store(last, Ordering::Release);
                self.num_actions
                    .store(u32::try_from(n - 1).expect("list fits in u32"), Ordering::Release);
                return;
            }
        }
    }

    /// Snapshot of the current action list.
    pub(crate) fn snapshot(&self) -> impl Iterator<Item = Handle> + '_ {
        let n = self.num_actions.load(Ordering::Acquire) as usize;
        self.actions[..n]
            .iter()
            .map(|a| Handle::from_bits(a.load(Ordering::Acquire)))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.num_actions.load(Ordering::Acquire) == 0
    }

    /// Advances the round-robin cursor used for action selection.
    pub(crate) fn next_round_robin(&self) -> u32 {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("num_actions", &self.num_actions.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// All jobs of the node, indexed by job id.
pub(crate) struct JobTable {
    jobs: Box<[Job]>,
}

impl JobTable {
    pub(crate) fn new(max_jobs: u32, max_actions_per_job: u32) -> JobTable {
        JobTable {
            jobs: (0..max_jobs)
                .map(|_| Job::with_capacity(max_actions_per_job))
                .collect(),
        }
    }

    pub(crate) fn get(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(job_id as usize)
    }
}

impl fmt::Debug for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTable")
            .field("max_jobs", &self.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_with_index(pool: &crate::pool::Pool<u32>, v: u32) -> Handle {
        pool.allocate(v).unwrap()
    }

    #[test]
    fn add_remove_round_trip() {
        let pool = crate::pool::Pool::with_capacity(8);
        let job = Job::with_capacity(4);
        let a = handle_with_index(&pool, 1);
        let b = handle_with_index(&pool, 2);

        job.add_action(a).unwrap();
        job.add_action(b).unwrap();
        assert_eq!(job.snapshot().collect::<Vec<_>>(), vec![a, b]);

        job.remove_action(a);
        assert_eq!(job.snapshot().collect::<Vec<_>>(), vec![b]);
        assert!(!job.is_empty());

        job.remove_action(b);
        assert!(job.is_empty());
    }

    #[test]
    fn per_job_limit() {
        let pool = crate::pool::Pool::with_capacity(8);
        let job = Job::with_capacity(2);
        job.add_action(handle_with_index(&pool, 1)).unwrap();
        job.add_action(handle_with_index(&pool, 2)).unwrap();
        assert_eq!(
            job.add_action(handle_with_index(&pool, 3)),
            Err(Error::ActionLimit)
        );
    }

    #[test]
    fn table_bounds() {
        let table = JobTable::new(4, 2);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
    }
}
