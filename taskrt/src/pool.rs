// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fixed-capacity object pools addressed by tag-versioned handles.
//!
//! A [`Handle`] is a `(index, tag)` pair. The tag is a per-slot generation
//! counter: even while the slot is free, odd while it is allocated, bumped on
//! every allocate and free. A handle resolves only while the slot's current
//! tag equals the handle's tag, so a handle held across a free/reallocate
//! cycle of its slot can never alias the new occupant.
//!
//! Slot contents are written only by the allocating thread (before the tag is
//! published) and dropped only by the single finalizer that wins the
//! deallocating tag bump. All other access is through shared references.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::fmt;
use core::mem::MaybeUninit;

pub(crate) const INVALID_INDEX: u32 = u32::MAX;

/// Index/tag pair referring to a pool slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Handle {
    index: u32,
    tag: u32,
}

impl Handle {
    pub(crate) const INVALID: Handle = Handle {
        index: INVALID_INDEX,
        tag: 0,
    };

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    /// Packs the handle into a single word, for storage in queues of raw
    /// handle bits.
    pub(crate) fn into_bits(self) -> u64 {
        (u64::from(self.tag) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_bits(bits: u64) -> Handle {
        Handle {
            index: (bits & 0xffff_ffff) as u32,
            tag: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == INVALID_INDEX {
            f.write_str("Handle(invalid)")
        } else {
            write!(f, "Handle({}v{})", self.index, self.tag)
        }
    }
}

/// A fixed-capacity slab with a lock-free free-index stack.
pub(crate) struct Pool<T> {
    slots: Box<[Slot<T>]>,
    free: FreeStack,
}

struct Slot<T> {
    /// Generation counter; odd while the slot is allocated.
    tag: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: access to the inner value follows the allocate/publish/free
// discipline described in the module docs; the pool hands out only shared
// references to live slots.
unsafe impl<T: Send + Sync> Send for Pool<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for Pool<T> {}

impl<T> Pool<T> {
    pub(crate) fn with_capacity(capacity: u32) -> Pool<T> {
        let slots = (0..capacity)
            .map(|_| Slot {
                tag: AtomicU32::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Pool {
            slots,
            free: FreeStack::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        u32::try_from(self.slots.len()).expect("pool capacity fits in u32")
    }

    /// Moves `value` into a free slot and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns the value back when the pool is exhausted; the caller maps
    /// this onto its kind-specific limit error.
    pub(crate) fn allocate(&self, value: T) -> Result<Handle, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        let slot = &self.slots[index as usize];

        // The slot is free (even tag) and owned by us until the tag is
        // published, so the unsynchronized load and plain write are fine.
        let tag = slot.tag.load(Ordering::Relaxed).wrapping_add(1);
        debug_assert_eq!(tag & 1, 1);
        slot.value.with_mut(|p| {
            // Safety: exclusive access, see above.
            unsafe { (*p).write(value) };
        });
        slot.tag.store(tag, Ordering::Release);

        Ok(Handle { index, tag })
    }

    /// Returns the live value addressed by `handle`, or `None` for stale,
    /// freed, or out-of-range handles.
    pub(crate) fn resolve(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        let tag = slot.tag.load(Ordering::Acquire);
        if tag != handle.tag || tag & 1 == 0 {
            return None;
        }
        let ptr = slot.value.with(|p| p);
        // Safety: the tag check witnessed the allocator's release store, so
        // the value is initialized. Per the freeing discipline, the single
        // finalizer only bumps the tag once no other thread may still act on
        // the handle.
        Some(unsafe { (*ptr).assume_init_ref() })
    }

    /// Drops the value addressed by `handle` and recycles the slot.
    ///
    /// Only one caller can win the deallocating tag bump; concurrent or
    /// repeated frees of the same handle return `false`.
    pub(crate) fn free(&self, handle: Handle) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return false;
        };
        if handle.tag & 1 == 0 {
            return false;
        }
        if slot
            .tag
            .compare_exchange(
                handle.tag,
                handle.tag.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }

        slot.value.with_mut(|p| {
            // Safety: the tag CAS made us the single finalizer.
            unsafe { (*p).assume_init_drop() };
        });
        self.free.push(handle.index);
        true
    }

    /// Visits every currently allocated slot.
    ///
    /// Concurrent allocates and frees may or may not be observed; the
    /// callback only ever sees slots that were live at the moment of their
    /// tag load.
    pub(crate) fn for_each(&self, mut f: impl FnMut(Handle, &T)) {
        for (index, slot) in self.slots.iter().enumerate() {
            let tag = slot.tag.load(Ordering::Acquire);
            if tag & 1 == 0 {
                continue;
            }
            let handle = Handle {
                index: u32::try_from(index).expect("pool capacity fits in u32"),
                tag,
            };
            let ptr = slot.value.with(|p| p);
            // Safety: tag was odd under an acquire load; see `resolve`.
            f(handle, unsafe { (*ptr).assume_init_ref() });
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if slot.tag.load(Ordering::Acquire) & 1 == 1 {
                slot.value.with_mut(|p| {
                    // Safety: `&mut self` means no outstanding borrows.
                    unsafe { (*p).assume_init_drop() };
                });
            }
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Treiber stack of free slot indices.
///
/// The head word packs `(version, index)`; the version is bumped on every
/// successful exchange, which rules out ABA on rapid pop/push cycles of the
/// same index.
struct FreeStack {
    head: AtomicU64,
    next: Box<[AtomicU32]>,
}

impl FreeStack {
    fn with_capacity(capacity: u32) -> FreeStack {
        let next = (0..capacity)
            .map(|i| {
                let succ = if i + 1 == capacity {
                    INVALID_INDEX
                } else {
                    i + 1
                };
                AtomicU32::new(succ)
            })
            .collect();
        let first = if capacity == 0 { INVALID_INDEX } else { 0 };

        FreeStack {
            head: AtomicU64::new(pack(0, first)),
            next,
        }
    }

    fn push(&self, index: u32) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (version, top) = unpack(head);
            self.next[index as usize].store(top, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(version.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn pop(&self) -> Option<u32> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (version, top) = unpack(head);
            if top == INVALID_INDEX {
                return None;
            }
            let succ = self.next[top as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(version.wrapping_add(1), succ),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => head = actual,
            }
        }
    }
}

fn pack(version: u32, index: u32) -> u64 {
    (u64::from(version) << 32) | u64::from(index)
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, (word & 0xffff_ffff) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn handle_bits_round_trip() {
        let h = Handle { index: 7, tag: 3 };
        assert_eq!(Handle::from_bits(h.into_bits()), h);
        assert_eq!(
            Handle::from_bits(Handle::INVALID.into_bits()),
            Handle::INVALID
        );
    }

    #[cfg(not(loom))]
    #[test]
    fn allocate_resolve_free() {
        let pool: Pool<String> = Pool::with_capacity(4);
        let h = pool.allocate("hello".to_owned()).unwrap();
        assert_eq!(pool.resolve(h).unwrap(), "hello");

        assert!(pool.free(h));
        assert!(pool.resolve(h).is_none());
        // double free is rejected
        assert!(!pool.free(h));
    }

    #[cfg(not(loom))]
    #[test]
    fn stale_handle_does_not_alias_new_occupant() {
        let pool: Pool<u32> = Pool::with_capacity(1);
        let old = pool.allocate(1).unwrap();
        assert!(pool.free(old));

        // the same slot is reused, but the old handle must keep failing
        let new = pool.allocate(2).unwrap();
        assert_eq!(new.index(), old.index());
        assert!(pool.resolve(old).is_none());
        assert_eq!(*pool.resolve(new).unwrap(), 2);
    }

    #[cfg(not(loom))]
    #[test]
    fn exhaustion_returns_value() {
        let pool: Pool<u32> = Pool::with_capacity(2);
        assert_eq!(pool.capacity(), 2);
        let _a = pool.allocate(1).unwrap();
        let _b = pool.allocate(2).unwrap();
        assert_eq!(pool.allocate(3).unwrap_err(), 3);
    }

    #[cfg(not(loom))]
    #[test]
    fn for_each_sees_only_live_slots() {
        let pool: Pool<u32> = Pool::with_capacity(4);
        let a = pool.allocate(10).unwrap();
        let b = pool.allocate(20).unwrap();
        pool.free(a);

        let mut seen = Vec::new();
        pool.for_each(|h, v| seen.push((h, *v)));
        assert_eq!(seen, vec![(b, 20)]);
    }

    #[cfg(not(loom))]
    #[test]
    fn drop_runs_destructors_of_live_slots() {
        use std::sync::Arc;
        let witness = Arc::new(());
        let pool: Pool<Arc<()>> = Pool::with_capacity(2);
        let _h = pool.allocate(Arc::clone(&witness)).unwrap();
        assert_eq!(Arc::strong_count(&witness), 2);
        drop(pool);
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn concurrent_alloc_free() {
        crate::loom::model(|| {
            use crate::loom::thread;
            use std::sync::Arc;

            let pool: Arc<Pool<usize>> = Arc::new(Pool::with_capacity(2));

            let joins: Vec<_> = (0..2)
                .map(|i| {
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        let h = pool.allocate(i).unwrap();
                        assert_eq!(*pool.resolve(h).unwrap(), i);
                        assert!(pool.free(h));
                        assert!(pool.resolve(h).is_none());
                    })
                })
                .collect();

            for join in joins {
                join.join().unwrap();
            }
        });
    }
}
