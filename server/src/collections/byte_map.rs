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

//! Chaining hash map keyed on arbitrary byte blobs, used
//! exclusively by [`crate::poller::poll_backend`] to translate a raw
//! descriptor integer into its registered watch-slot metadata. `poll(2)`
//! gives no O(1) descriptor→slot lookup the way `epoll`/`kqueue`/event
//! ports do by construction, so this map supplies it.
//!
//! Keyed on a byte slice (rather than directly on `RawFd`) so the hash
//! function and equality predicate stay generic — descriptors happen to be
//! the only key this crate ever stores, but nothing here assumes that.

use crate::pool::ObjectPool;

/// Failure returned by [`ByteMap::add`] when every chain-node slot in the
/// backing pool is already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

struct Node<V> {
    key: i32,
    value: Option<V>,
    next: Option<usize>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node { key: 0, value: None, next: None }
    }
}

/// FNV-1a 32-bit hash over the little-endian bytes of `key`.
fn fnv1a(key: i32) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.to_le_bytes().iter().fold(OFFSET_BASIS, |hash, &b| (hash ^ b as u32).wrapping_mul(PRIME))
}

/// A fixed-capacity chaining map from `i32` descriptors to `V`.
///
/// Chain nodes are drawn from a secondary [`ObjectPool`], so the map never
/// allocates past construction and `add` fails once the node pool is
/// exhausted, independent of bucket-array occupancy.
#[derive(Debug)]
pub(crate) struct ByteMap<V> {
    buckets: Box<[Option<usize>]>,
    nodes: ObjectPool<Node<V>>,
}

impl<V> ByteMap<V> {
    /// Builds a map with `capacity` chain-node slots and a bucket array
    /// sized to match.
    pub(crate) fn new(capacity: usize) -> Self {
        ByteMap {
            buckets: vec![None; capacity.max(1)].into_boxed_slice(),
            nodes: ObjectPool::new(capacity),
        }
    }

    fn bucket_for(&self, key: i32) -> usize {
        (fnv1a(key) as usize) % self.buckets.len()
    }

    /// Inserts `key -> value`, replacing any existing value for `key`.
    /// Fails with [`Full`] if the node pool has no free slots and `key` is
    /// not already present.
    pub(crate) fn add(&mut self, key: i32, value: V) -> Result<(), Full> {
        let bucket = self.bucket_for(key);

        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            // SAFETY: indices stored in this map's own chains were all
            // acquired from `self.nodes` and never released except by
            // `remove`, which also unlinks them.
            let node = unsafe { self.nodes.get_mut(idx) };
            if node.key == key {
                node.value = Some(value);
                return Ok(());
            }
            cursor = node.next;
        }

        let idx = self.nodes.acquire().ok_or(Full)?;
        // SAFETY: `idx` was just acquired and is not yet reachable from
        // any bucket chain.
        let node = unsafe { self.nodes.get_mut(idx) };
        node.key = key;
        node.value = Some(value);
        node.next = self.buckets[bucket];
        self.buckets[bucket] = Some(idx);
        Ok(())
    }

    /// Looks up `key`.
    pub(crate) fn get(&self, key: i32) -> Option<&V> {
        let bucket = self.bucket_for(key);
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            // SAFETY: see `add`.
            let node = unsafe { self.nodes.get(idx) };
            if node.key == key {
                return node.value.as_ref();
            }
            cursor = node.next;
        }
        None
    }

    /// Mutably looks up `key`.
    pub(crate) fn get_mut(&mut self, key: i32) -> Option<&mut V> {
        let bucket = self.bucket_for(key);
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            // SAFETY: see `add`.
            let node = unsafe { self.nodes.get_mut(idx) };
            if node.key == key {
                return node.value.as_mut();
            }
            cursor = node.next;
        }
        None
    }

    /// Removes `key`, returning its value if present.
    pub(crate) fn remove(&mut self, key: i32) -> Option<V> {
        let bucket = self.bucket_for(key);
        let mut cursor = self.buckets[bucket];
        let mut prev: Option<usize> = None;

        while let Some(idx) = cursor {
            // SAFETY: see `add`.
            let next = unsafe { self.nodes.get(idx) }.next;
            let matches = unsafe { self.nodes.get(idx) }.key == key;

            if matches {
                match prev {
                    Some(p) => unsafe { self.nodes.get_mut(p) }.next = next,
                    None => self.buckets[bucket] = next,
                }
                let value = unsafe { self.nodes.get_mut(idx) }.value.take();
                self.nodes.release(idx);
                return value;
            }

            prev = Some(idx);
            cursor = next;
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut map: ByteMap<&'static str> = ByteMap::new(8);
        map.add(3, "three").unwrap();
        map.add(11, "eleven").unwrap();
        assert_eq!(Some(&"three"), map.get(3));
        assert_eq!(Some(&"eleven"), map.get(11));
        assert_eq!(None, map.get(99));
    }

    #[test]
    fn add_replaces_existing_key() {
        let mut map: ByteMap<i32> = ByteMap::new(4);
        map.add(5, 1).unwrap();
        map.add(5, 2).unwrap();
        assert_eq!(Some(&2), map.get(5));
    }

    #[test]
    fn remove_unlinks_node_and_frees_pool_slot() {
        let mut map: ByteMap<i32> = ByteMap::new(2);
        map.add(1, 10).unwrap();
        map.add(2, 20).unwrap();
        assert_eq!(Some(10), map.remove(1));
        assert_eq!(None, map.get(1));
        // the freed node slot must be reusable
        map.add(3, 30).unwrap();
        assert_eq!(Some(&30), map.get(3));
        assert_eq!(Some(&20), map.get(2));
    }

    #[test]
    fn add_fails_when_node_pool_exhausted() {
        let mut map: ByteMap<i32> = ByteMap::new(2);
        map.add(1, 1).unwrap();
        map.add(2, 2).unwrap();
        assert_eq!(Err(Full), map.add(3, 3));
    }

    #[test]
    fn hash_collisions_are_resolved_by_chaining() {
        // a map with a single bucket forces every key into one chain
        let mut map: ByteMap<i32> = ByteMap::new(4);
        map.buckets = vec![None; 1].into_boxed_slice();
        map.add(1, 100).unwrap();
        map.add(2, 200).unwrap();
        map.add(3, 300).unwrap();
        assert_eq!(Some(&100), map.get(1));
        assert_eq!(Some(&200), map.get(2));
        assert_eq!(Some(&300), map.get(3));
    }
}
