// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-capacity object pool.
//!
//! A single contiguous block of `capacity` slots, handed out by index
//! rather than raw pointer. `acquire` and
//! `release` are the pool's only writers and are serialized by one mutex
//! guarding the free list; the free list is LIFO, so the most recently
//! released slot is the next one handed out.
//!
//! Once a slot is acquired, the caller owns exclusive access to it until
//! `release` — the pool does not itself prevent concurrent access to the
//! same slot from two threads. That invariant is upheld by the Manager's
//! callers (exactly one Worker polls a given Job at a time), not
//! by this module.

use std::cell::UnsafeCell;
use std::fmt::{self, Debug, Formatter};
use std::sync::Mutex;

/// A fixed-size pool of `T` slots with O(1) acquire/release.
pub struct ObjectPool<T> {
    slots: Box<[UnsafeCell<T>]>,
    free: Mutex<Vec<usize>>,
}

// SAFETY: access to a given slot is externally synchronized by the
// acquire/release protocol — only the thread holding an acquired index
// touches that slot, and `free` (the only state shared without an index)
// is guarded by `Mutex`.
unsafe impl<T: Send> Sync for ObjectPool<T> {}
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T: Default> ObjectPool<T> {
    /// Builds a pool of `capacity` slots, each default-initialized.
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<_> = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
        ObjectPool { slots: slots.into_boxed_slice(), free: Mutex::new((0..capacity).collect()) }
    }

    /// Total number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the index of a free slot, reset to `T::default()`, or
    /// `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<usize> {
        let mut free = self.free.lock().expect("pool free-list mutex poisoned");
        let idx = free.pop()?;
        // SAFETY: `idx` was just popped off the free list, so no other
        // acquired handle currently references it.
        unsafe {
            *self.slots[idx].get() = T::default();
        }
        Some(idx)
    }

    /// Returns `idx` to the free list, making it eligible for a future
    /// `acquire`. Double-releasing the same index is a caller bug, flagged
    /// in debug builds via assertion rather than prevented at runtime.
    pub fn release(&self, idx: usize) {
        let mut free = self.free.lock().expect("pool free-list mutex poisoned");
        debug_assert!(
            idx < self.slots.len() && !free.contains(&idx),
            "double release or out-of-range index {idx} in object pool"
        );
        free.push(idx);
    }

    /// Borrows the slot at `idx`.
    ///
    /// # Safety
    /// `idx` must have been returned by `acquire` and not yet passed to
    /// `release`, and the caller must not alias this borrow with another
    /// live borrow of the same slot on another thread.
    #[inline]
    pub unsafe fn get(&self, idx: usize) -> &T {
        &*self.slots[idx].get()
    }

    /// Mutably borrows the slot at `idx`. Same safety contract as [`get`](Self::get).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, idx: usize) -> &mut T {
        &mut *self.slots[idx].get()
    }
}

impl<T> Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let free_count = self.free.lock().map(|f| f.len()).unwrap_or(0);
        f.debug_struct("ObjectPool")
            .field("capacity", &self.slots.len())
            .field("free", &free_count)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn acquire_exhausts_at_capacity() {
        let pool: ObjectPool<u32> = ObjectPool::new(2);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn released_slot_is_reacquireable() {
        let pool: ObjectPool<u32> = ObjectPool::new(1);
        let idx = pool.acquire().unwrap();
        pool.release(idx);
        assert_eq!(Some(idx), pool.acquire());
    }

    #[test]
    fn acquire_never_aliases_two_live_slots() {
        let pool: ObjectPool<u32> = ObjectPool::new(8);
        let mut seen = HashSet::new();
        let mut held = Vec::new();
        while let Some(idx) = pool.acquire() {
            assert!(seen.insert(idx), "slot {idx} acquired twice while still live");
            held.push(idx);
        }
        assert_eq!(8, held.len());
        for idx in held {
            pool.release(idx);
        }
        // every released slot can be acquired again
        let mut reacquired = HashSet::new();
        while let Some(idx) = pool.acquire() {
            reacquired.insert(idx);
        }
        assert_eq!(seen, reacquired);
    }

    #[test]
    fn acquire_resets_slot_to_default() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(1);
        let idx = pool.acquire().unwrap();
        unsafe { pool.get_mut(idx).push(1) };
        pool.release(idx);
        let idx = pool.acquire().unwrap();
        assert!(unsafe { pool.get(idx) }.is_empty());
    }
}
