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

//! The object-pool front-end that hands out Jobs:
//! `acquire` returns a slot or reports exhaustion; `release` makes it
//! available again. Thread-safety is inherited from [`ObjectPool`]'s own
//! mutex-guarded free list.

use std::sync::Arc;

use crate::job::Job;
use crate::pool::ObjectPool;

/// Owns the fixed-capacity pool of [`Job`]s shared by every
/// [`crate::worker::Worker`].
/// Cloning a `Manager` clones the `Arc`, so every Worker and Listener can
/// hold one without lifetime gymnastics.
#[derive(Clone)]
pub struct Manager {
    pool: Arc<ObjectPool<Job>>,
}

impl Manager {
    /// Builds a Manager sized to `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Manager { pool: Arc::new(ObjectPool::new(max_connections)) }
    }

    /// Total capacity this Manager was built with.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Acquires a zeroed Job slot, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<JobHandle> {
        let idx = self.pool.acquire()?;
        Some(JobHandle { manager: self.clone(), idx })
    }

    fn release(&self, idx: usize) {
        self.pool.release(idx);
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").field("pool", &self.pool).finish()
    }
}

/// An acquired Job slot. Dropping the handle releases it back to the
/// Manager — the Worker holds one of these per in-flight connection.
pub struct JobHandle {
    manager: Manager,
    idx: usize,
}

impl JobHandle {
    /// The pool index backing this handle; used as the poller
    /// [`crate::poller::Token`] for the job's socket.
    pub fn index(&self) -> usize {
        self.idx
    }

    /// Borrows the underlying Job.
    ///
    /// # Safety
    /// The caller must not alias this borrow with another live borrow of
    /// the same index from another `JobHandle` — upheld by construction,
    /// since a `JobHandle` is only created by `Manager::acquire` and never
    /// cloned.
    pub unsafe fn get(&self) -> &Job {
        self.manager.pool.get(self.idx)
    }

    /// Mutably borrows the underlying Job. Same safety contract as [`get`](Self::get).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut Job {
        self.manager.pool.get_mut(self.idx)
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.manager.release(self.idx);
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("idx", &self.idx).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_fails_when_capacity_exhausted() {
        let manager = Manager::new(1);
        let first = manager.acquire();
        assert!(first.is_some());
        assert!(manager.acquire().is_none());
    }

    #[test]
    fn dropping_handle_frees_the_slot() {
        let manager = Manager::new(1);
        {
            let _handle = manager.acquire().unwrap();
            assert!(manager.acquire().is_none());
        }
        assert!(manager.acquire().is_some());
    }

    #[test]
    fn handle_index_is_reused_after_release() {
        let manager = Manager::new(2);
        let a = manager.acquire().unwrap();
        let idx_a = a.index();
        drop(a);
        let b = manager.acquire().unwrap();
        assert_eq!(idx_a, b.index());
    }
}
