// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded lock-free MPMC FIFO of raw handle words.
//!
//! Bounded array queue with per-cell sequence counters (the Vyukov scheme):
//! a producer claims a cell by advancing `enqueue_pos` when the cell's
//! sequence matches it, a consumer by advancing `dequeue_pos` when the
//! sequence is one ahead. The sequence is republished after each access, so
//! cells are handed back and forth without any shared lock.
//!
//! One instance backs each global priority queue, each worker's local queue
//! and each group's completion queue.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;

#[repr(align(128))]
struct CachePadded<T>(T);

pub(crate) struct Fifo {
    buffer: Box<[Cell]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

struct Cell {
    sequence: AtomicUsize,
    value: UnsafeCell<u64>,
}

// Safety: cell values are plain words, exchanged under the sequence protocol.
unsafe impl Send for Fifo {}
// Safety: see above.
unsafe impl Sync for Fifo {}

impl Fifo {
    /// Creates a queue able to hold at least `capacity` entries (rounded up
    /// to a power of two).
    pub(crate) fn with_capacity(capacity: usize) -> Fifo {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(0),
            })
            .collect();

        Fifo {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded(AtomicUsize::new(0)),
            dequeue_pos: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Appends `value`; returns `false` when the queue is full.
    pub(crate) fn push(&self, value: u64) -> bool {
        let mut pos = self.enqueue_pos.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);

            if seq == pos {
                match self.enqueue_pos.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.with_mut(|p| {
                            // Safety: winning the position CAS grants
                            // exclusive access until the sequence store.
                            unsafe { *p = value };
                        });
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq.wrapping_sub(pos) as isize > 0 {
                // someone else claimed this cell, catch up
                pos = self.enqueue_pos.0.load(Ordering::Relaxed);
            } else {
                // the consumer lags a full lap behind: full
                return false;
            }
        }
    }

    /// Removes and returns the oldest entry.
    pub(crate) fn pop(&self) -> Option<u64> {
        let mut pos = self.dequeue_pos.0.load(Ordering::Relaxed);
        loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let expected = pos.wrapping_add(1);

            if seq == expected {
                match self.dequeue_pos.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.with(|p| {
                            // Safety: winning the position CAS grants
                            // exclusive access until the sequence store.
                            unsafe { *p }
                        });
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if seq.wrapping_sub(expected) as isize > 0 {
                pos = self.dequeue_pos.0.load(Ordering::Relaxed);
            } else {
                // producer has not reached this cell: empty
                return None;
            }
        }
    }

    /// Approximate number of queued entries. Exact only while no producer or
    /// consumer is mid-operation.
    pub(crate) fn len(&self) -> usize {
        let head = self.dequeue_pos.0.load(Ordering::Relaxed);
        let tail = self.enqueue_pos.0.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Fifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("capacity", &(self.mask + 1))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn fifo_order() {
        let q = Fifo::with_capacity(8);
        for i in 0..5u64 {
            assert!(q.push(i));
        }
        for i in 0..5u64 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn full_queue_rejects() {
        let q = Fifo::with_capacity(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3));
    }

    #[cfg(not(loom))]
    #[test]
    fn wraps_around() {
        let q = Fifo::with_capacity(4);
        for round in 0..20u64 {
            assert!(q.push(round));
            assert_eq!(q.pop(), Some(round));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_producers_consumers() {
        crate::loom::model(|| {
            use crate::loom::thread;
            use std::sync::Arc;

            let q = Arc::new(Fifo::with_capacity(4));

            let producers: Vec<_> = (0..2u64)
                .map(|i| {
                    let q = Arc::clone(&q);
                    thread::spawn(move || {
                        while !q.push(i + 1) {
                            thread::yield_now();
                        }
                    })
                })
                .collect();

            let consumer = {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut got = 0;
                    let mut sum = 0;
                    while got < 2 {
                        if let Some(v) = q.pop() {
                            got += 1;
                            sum += v;
                        } else {
                            thread::yield_now();
                        }
                    }
                    sum
                })
            };

            for p in producers {
                p.join().unwrap();
            }
            assert_eq!(consumer.join().unwrap(), 3);
        });
    }
}
