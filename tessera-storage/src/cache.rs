// SPDX-License-Identifier: AGPL-3.0-or-later
// Tessera - Columnar Tablet Storage Engine
// Copyright (C) 2026 Tessera Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sharded, reference-counted LRU block cache
//!
//! General-purpose eviction cache for read paths (decoded blocks, index
//! pages). Sixteen independent shards, selected by the top 4 bits of a
//! 64-bit key hash, each with its own lock, chained hash table, and
//! circular LRU list:
//!
//! ```text
//! key ──xxhash64──► [4 bits: shard] [low 32 bits: per-shard hash]
//!                      │
//!                      ▼
//!        ┌─ shard lock ──────────────────────────┐
//!        │ hash table (chains, avg length ≤ 1)   │
//!        │ LRU ring: sentinel ◄─► oldest … newest │
//!        │ usage: Σ live charges                 │
//!        └───────────────────────────────────────┘
//! ```
//!
//! Entries are reference-counted: the cache holds one reference, every
//! outstanding handle holds another. The caller-supplied deleter runs
//! exactly once, when the count reaches zero, so readers can keep using a
//! value after it has been evicted or erased. Shard usage is charged to a
//! shared memory tracker.

use std::any::Any;
use std::hash::Hasher;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use twox_hash::XxHash64;

use crate::mem_tracker::{MemTracker, NO_LIMIT};

const NUM_SHARD_BITS: u32 = 4;
pub const NUM_CACHE_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// Opaque cached value.
pub type CacheValue = Box<dyn Any + Send + Sync>;

/// Runs exactly once when an entry's reference count reaches zero.
pub type CacheDeleter = Box<dyn FnOnce(&[u8], CacheValue) + Send>;

/// Heap-allocated cache entry, linked into both a hash chain and the
/// circular LRU list of its shard.
struct LruEntry {
    value: Option<CacheValue>,
    deleter: Option<CacheDeleter>,
    next_hash: *mut LruEntry,
    next: *mut LruEntry,
    prev: *mut LruEntry,
    charge: usize,
    /// Per-shard hash (low 32 bits of the key hash).
    hash: u32,
    /// Which shard owns this entry; handles release through it.
    shard_idx: u8,
    /// One reference held by the cache while resident, one per handle.
    refs: u32,
    key: Box<[u8]>,
}

impl LruEntry {
    fn sentinel() -> LruEntry {
        LruEntry {
            value: None,
            deleter: None,
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge: 0,
            hash: 0,
            shard_idx: 0,
            refs: 0,
            key: Vec::new().into_boxed_slice(),
        }
    }
}

/// Chained hash table with power-of-two sizing, grown to keep the average
/// chain length at one.
struct HandleTable {
    list: Vec<*mut LruEntry>,
    elems: usize,
}

impl HandleTable {
    fn new() -> HandleTable {
        HandleTable {
            list: vec![ptr::null_mut(); 4],
            elems: 0,
        }
    }

    /// Slot holding the entry for `key`/`hash`, or the trailing null slot
    /// of its chain.
    fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut LruEntry {
        let mask = self.list.len() - 1;
        let mut slot: *mut *mut LruEntry = &mut self.list[(hash as usize) & mask];
        unsafe {
            while !(*slot).is_null() && ((**slot).hash != hash || &(&(**slot).key)[..] != key) {
                slot = &mut (**slot).next_hash;
            }
        }
        slot
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> *mut LruEntry {
        unsafe { *self.find_pointer(key, hash) }
    }

    /// Inserts `entry`, returning a displaced entry with the same key (or
    /// null).
    fn insert(&mut self, entry: *mut LruEntry) -> *mut LruEntry {
        unsafe {
            let (key, hash): (*const [u8], u32) = (&(&(*entry).key)[..], (*entry).hash);
            let slot = self.find_pointer(&*key, hash);
            let old = *slot;
            (*entry).next_hash = if old.is_null() {
                ptr::null_mut()
            } else {
                (*old).next_hash
            };
            *slot = entry;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.list.len() {
                    self.resize();
                }
            }
            old
        }
    }

    fn remove(&mut self, key: &[u8], hash: u32) -> *mut LruEntry {
        unsafe {
            let slot = self.find_pointer(key, hash);
            let result = *slot;
            if !result.is_null() {
                *slot = (*result).next_hash;
                self.elems -= 1;
            }
            result
        }
    }

    fn resize(&mut self) {
        let mut new_len = 4;
        while new_len < self.elems {
            new_len *= 2;
        }
        let mut new_list: Vec<*mut LruEntry> = vec![ptr::null_mut(); new_len];
        let mut count = 0;
        for i in 0..self.list.len() {
            let mut entry = self.list[i];
            while !entry.is_null() {
                unsafe {
                    let next = (*entry).next_hash;
                    let slot = &mut new_list[((*entry).hash as usize) & (new_len - 1)];
                    (*entry).next_hash = *slot;
                    *slot = entry;
                    entry = next;
                }
                count += 1;
            }
        }
        debug_assert_eq!(self.elems, count);
        self.list = new_list;
    }
}

struct ShardState {
    usage: usize,
    /// Sentinel of the circular LRU list. `lru.prev` is the newest entry,
    /// `lru.next` the oldest.
    lru: *mut LruEntry,
    table: HandleTable,
}

unsafe impl Send for ShardState {}

/// One independent shard: lock, table, LRU list, usage.
struct LruShard {
    capacity: usize,
    state: Mutex<ShardState>,
    mem_tracker: Arc<MemTracker>,
}

impl LruShard {
    fn new(capacity: usize, mem_tracker: Arc<MemTracker>) -> LruShard {
        let lru = Box::into_raw(Box::new(LruEntry::sentinel()));
        unsafe {
            (*lru).next = lru;
            (*lru).prev = lru;
        }
        LruShard {
            capacity,
            state: Mutex::new(ShardState {
                usage: 0,
                lru,
                table: HandleTable::new(),
            }),
            mem_tracker,
        }
    }

    unsafe fn lru_remove(entry: *mut LruEntry) {
        (*(*entry).next).prev = (*entry).prev;
        (*(*entry).prev).next = (*entry).next;
    }

    /// Makes `entry` the newest by inserting just before the sentinel.
    unsafe fn lru_append(lru: *mut LruEntry, entry: *mut LruEntry) {
        (*entry).next = lru;
        (*entry).prev = (*lru).prev;
        (*(*entry).prev).next = entry;
        (*(*entry).next).prev = entry;
    }

    /// Drops one reference; frees the entry and runs its deleter when the
    /// count reaches zero.
    fn unref(state: &mut ShardState, mem_tracker: &MemTracker, entry: *mut LruEntry) {
        unsafe {
            debug_assert!((*entry).refs > 0);
            (*entry).refs -= 1;
            if (*entry).refs == 0 {
                state.usage -= (*entry).charge;
                mem_tracker.release((*entry).charge as i64);
                let mut entry = Box::from_raw(entry);
                if let Some(deleter) = entry.deleter.take() {
                    let value = entry.value.take().expect("value lives until final unref");
                    deleter(&entry.key, value);
                }
            }
        }
    }

    fn insert(
        &self,
        key: &[u8],
        hash: u32,
        shard_idx: u8,
        value: CacheValue,
        charge: usize,
        deleter: CacheDeleter,
    ) -> NonNull<LruEntry> {
        let entry = Box::into_raw(Box::new(LruEntry {
            value: Some(value),
            deleter: Some(deleter),
            next_hash: ptr::null_mut(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            charge,
            hash,
            shard_idx,
            refs: 2, // one for the cache, one for the returned handle
            key: key.to_vec().into_boxed_slice(),
        }));

        let mut state = self.state.lock();
        self.mem_tracker.consume(charge as i64);
        unsafe {
            Self::lru_append(state.lru, entry);
        }
        state.usage += charge;

        let old = state.table.insert(entry);
        if !old.is_null() {
            unsafe {
                Self::lru_remove(old);
            }
            Self::unref(&mut state, &self.mem_tracker, old);
        }

        while state.usage > self.capacity {
            let oldest = unsafe { (*state.lru).next };
            if oldest == state.lru {
                break;
            }
            unsafe {
                Self::lru_remove(oldest);
                let (key, hash): (*const [u8], u32) = (&(&(*oldest).key)[..], (*oldest).hash);
                state.table.remove(&*key, hash);
            }
            Self::unref(&mut state, &self.mem_tracker, oldest);
        }

        unsafe { NonNull::new_unchecked(entry) }
    }

    fn lookup(&self, key: &[u8], hash: u32) -> Option<NonNull<LruEntry>> {
        let mut state = self.state.lock();
        let entry = state.table.lookup(key, hash);
        if entry.is_null() {
            return None;
        }
        unsafe {
            (*entry).refs += 1;
            Self::lru_remove(entry);
            Self::lru_append(state.lru, entry);
            Some(NonNull::new_unchecked(entry))
        }
    }

    fn release(&self, entry: *mut LruEntry) {
        let mut state = self.state.lock();
        Self::unref(&mut state, &self.mem_tracker, entry);
    }

    fn erase(&self, key: &[u8], hash: u32) {
        let mut state = self.state.lock();
        let entry = state.table.remove(key, hash);
        if !entry.is_null() {
            unsafe {
                Self::lru_remove(entry);
            }
            Self::unref(&mut state, &self.mem_tracker, entry);
        }
    }

    fn usage(&self) -> usize {
        self.state.lock().usage
    }
}

impl Drop for LruShard {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        unsafe {
            let lru = state.lru;
            let mut entry = (*lru).next;
            while entry != lru {
                let next = (*entry).next;
                // Error if a caller still holds a handle at teardown.
                debug_assert_eq!((*entry).refs, 1, "unreleased cache handle");
                Self::unref(state, &self.mem_tracker, entry);
                entry = next;
            }
            drop(Box::from_raw(lru));
        }
    }
}

/// Reference to a live cache entry. Dropping it releases the reference;
/// the value stays valid for the handle's lifetime even if the entry has
/// been evicted or erased.
pub struct CacheHandle {
    cache: Arc<CacheShards>,
    entry: NonNull<LruEntry>,
}

unsafe impl Send for CacheHandle {}
unsafe impl Sync for CacheHandle {}

impl CacheHandle {
    pub fn key(&self) -> &[u8] {
        unsafe { &self.entry.as_ref().key }
    }

    pub fn value(&self) -> &(dyn Any + Send + Sync) {
        unsafe {
            self.entry
                .as_ref()
                .value
                .as_ref()
                .expect("value lives while a handle exists")
                .as_ref()
        }
    }

    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value().downcast_ref::<T>()
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let shard_idx = unsafe { self.entry.as_ref().shard_idx } as usize;
        self.cache.shards[shard_idx].release(self.entry.as_ptr());
    }
}

struct CacheShards {
    shards: Vec<LruShard>,
    mem_tracker: Arc<MemTracker>,
    id_mutex: Mutex<u64>,
}

/// The sharded cache facade.
pub struct ShardedLruCache {
    inner: Arc<CacheShards>,
}

impl ShardedLruCache {
    /// A cache bounding total charge at `capacity` bytes, split evenly
    /// across [`NUM_CACHE_SHARDS`] shards.
    pub fn new(capacity: usize) -> ShardedLruCache {
        let mem_tracker = MemTracker::create(NO_LIMIT, "sharded_lru_cache", None);
        let per_shard = (capacity + NUM_CACHE_SHARDS - 1) / NUM_CACHE_SHARDS;
        let shards = (0..NUM_CACHE_SHARDS)
            .map(|_| LruShard::new(per_shard, mem_tracker.clone()))
            .collect();
        ShardedLruCache {
            inner: Arc::new(CacheShards {
                shards,
                mem_tracker,
                id_mutex: Mutex::new(0),
            }),
        }
    }

    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key);
        hasher.finish()
    }

    #[inline]
    fn shard_index(hash: u64) -> usize {
        (hash >> (64 - NUM_SHARD_BITS)) as usize
    }

    #[inline]
    fn shard_hash(hash: u64) -> u32 {
        hash as u32
    }

    /// Inserts an entry and returns a handle to it. `charge` is the byte
    /// weight used for capacity accounting; `deleter` runs exactly once
    /// when the last reference goes away. An existing entry with the same
    /// key is displaced (its deleter runs once its holders release it).
    pub fn insert(
        &self,
        key: &[u8],
        value: CacheValue,
        charge: usize,
        deleter: CacheDeleter,
    ) -> CacheHandle {
        let hash = Self::hash_key(key);
        let idx = Self::shard_index(hash);
        let entry = self.inner.shards[idx].insert(
            key,
            Self::shard_hash(hash),
            idx as u8,
            value,
            charge,
            deleter,
        );
        CacheHandle {
            cache: self.inner.clone(),
            entry,
        }
    }

    /// On hit, bumps the entry to most-recently-used and returns a handle.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle> {
        let hash = Self::hash_key(key);
        let idx = Self::shard_index(hash);
        self.inner.shards[idx]
            .lookup(key, Self::shard_hash(hash))
            .map(|entry| CacheHandle {
                cache: self.inner.clone(),
                entry,
            })
    }

    /// Releases a handle. Equivalent to dropping it.
    pub fn release(&self, handle: CacheHandle) {
        drop(handle);
    }

    /// Removes the entry from the cache. Outstanding handles keep the
    /// value alive until they are released.
    pub fn erase(&self, key: &[u8]) {
        let hash = Self::hash_key(key);
        self.inner.shards[Self::shard_index(hash)].erase(key, Self::shard_hash(hash));
    }

    /// Monotonic id source for clients that tag entries (e.g. per-file
    /// block ids).
    pub fn new_id(&self) -> u64 {
        let mut last_id = self.inner.id_mutex.lock();
        *last_id += 1;
        *last_id
    }

    /// Total live charge across shards.
    pub fn usage(&self) -> usize {
        self.inner.shards.iter().map(|s| s.usage()).sum()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.inner.mem_tracker
    }

    #[cfg(test)]
    fn shard_of(&self, key: &[u8]) -> usize {
        Self::shard_index(Self::hash_key(key))
    }

    #[cfg(test)]
    fn shard_capacity(&self) -> usize {
        self.inner.shards[0].capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_deleter() -> CacheDeleter {
        Box::new(|_key, _value| {})
    }

    fn counting_deleter(counter: &Arc<AtomicUsize>) -> CacheDeleter {
        let counter = counter.clone();
        Box::new(move |_key, _value| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// First `n` distinct keys that land in the same shard.
    fn same_shard_keys(cache: &ShardedLruCache, n: usize) -> Vec<Vec<u8>> {
        let target = cache.shard_of(b"seed");
        let mut keys = vec![b"seed".to_vec()];
        let mut i = 0u64;
        while keys.len() < n {
            let key = format!("key-{}", i).into_bytes();
            if cache.shard_of(&key) == target {
                keys.push(key);
            }
            i += 1;
        }
        keys
    }

    #[test]
    fn test_insert_lookup_roundtrip() {
        let cache = ShardedLruCache::new(1 << 20);
        let handle = cache.insert(b"block-1", Box::new(42u64), 16, noop_deleter());
        assert_eq!(handle.value_as::<u64>(), Some(&42));
        assert_eq!(handle.key(), b"block-1");
        drop(handle);

        let hit = cache.lookup(b"block-1").expect("hit");
        assert_eq!(hit.value_as::<u64>(), Some(&42));
        assert!(cache.lookup(b"block-2").is_none());
    }

    #[test]
    fn test_lru_eviction_order() {
        // Capacity three entries per shard; four same-shard inserts with a
        // touch in between must evict the least-recently-used key.
        let cache = ShardedLruCache::new(NUM_CACHE_SHARDS * 3);
        let keys = same_shard_keys(&cache, 4);
        let charge = 1;

        for key in &keys[..3] {
            cache.release(cache.insert(key, Box::new(0u8), charge, noop_deleter()));
        }
        // Touch key 0 so key 1 becomes the oldest.
        cache.release(cache.lookup(&keys[0]).expect("hit"));
        cache.release(cache.insert(&keys[3], Box::new(0u8), charge, noop_deleter()));

        assert!(cache.lookup(&keys[1]).is_none(), "LRU entry evicted");
        assert!(cache.lookup(&keys[0]).is_some());
        assert!(cache.lookup(&keys[2]).is_some());
        assert!(cache.lookup(&keys[3]).is_some());
    }

    #[test]
    fn test_usage_bounded_after_insert() {
        let cache = ShardedLruCache::new(NUM_CACHE_SHARDS * 100);
        let keys = same_shard_keys(&cache, 50);
        for key in &keys {
            cache.release(cache.insert(key, Box::new(0u8), 7, noop_deleter()));
            assert!(cache.usage() <= NUM_CACHE_SHARDS * 100);
        }
    }

    #[test]
    fn test_refcount_and_deleter_exactly_once() {
        let cache = ShardedLruCache::new(1 << 20);
        let deletions = Arc::new(AtomicUsize::new(0));

        let h1 = cache.insert(b"K", Box::new(5u64), 1, counting_deleter(&deletions));
        let h2 = cache.lookup(b"K").expect("hit");

        cache.erase(b"K");
        assert_eq!(deletions.load(Ordering::SeqCst), 0);
        assert!(cache.lookup(b"K").is_none());

        cache.release(h1);
        assert_eq!(deletions.load(Ordering::SeqCst), 0);
        // Value remains readable through the surviving handle.
        assert_eq!(h2.value_as::<u64>(), Some(&5));

        cache.release(h2);
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reinsert_displaces_old_entry() {
        let cache = ShardedLruCache::new(1 << 20);
        let deletions = Arc::new(AtomicUsize::new(0));

        cache.release(cache.insert(b"K", Box::new(1u64), 1, counting_deleter(&deletions)));
        cache.release(cache.insert(b"K", Box::new(2u64), 1, counting_deleter(&deletions)));
        assert_eq!(deletions.load(Ordering::SeqCst), 1, "old entry deleted once");

        let hit = cache.lookup(b"K").expect("hit");
        assert_eq!(hit.value_as::<u64>(), Some(&2));
    }

    #[test]
    fn test_overweight_entry_drains_shard() {
        let cache = ShardedLruCache::new(NUM_CACHE_SHARDS * 10);
        let keys = same_shard_keys(&cache, 3);
        let shard_cap = cache.shard_capacity();

        cache.release(cache.insert(&keys[0], Box::new(0u8), 2, noop_deleter()));
        cache.release(cache.insert(&keys[1], Box::new(0u8), 2, noop_deleter()));

        // A single entry heavier than the shard: everything is drained and
        // the entry itself survives only through the returned handle.
        let big = cache.insert(&keys[2], Box::new(7u64), shard_cap + 1, noop_deleter());
        assert!(cache.lookup(&keys[0]).is_none());
        assert!(cache.lookup(&keys[1]).is_none());
        assert_eq!(big.value_as::<u64>(), Some(&7));
        assert_eq!(cache.usage(), shard_cap + 1);

        cache.release(big);
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_erase_absent_key_is_noop() {
        let cache = ShardedLruCache::new(1 << 10);
        cache.erase(b"never-inserted");
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_new_id_monotonic() {
        let cache = ShardedLruCache::new(1 << 10);
        let a = cache.new_id();
        let b = cache.new_id();
        assert!(b > a);
    }

    #[test]
    fn test_mem_tracker_follows_usage() {
        let cache = ShardedLruCache::new(1 << 20);
        let h = cache.insert(b"K", Box::new(0u8), 512, noop_deleter());
        assert_eq!(cache.mem_tracker().consumption(), 512);
        cache.erase(b"K");
        assert_eq!(cache.mem_tracker().consumption(), 512, "held handle keeps charge");
        cache.release(h);
        assert_eq!(cache.mem_tracker().consumption(), 0);
    }

    #[test]
    fn test_concurrent_mixed_workload() {
        let cache = Arc::new(ShardedLruCache::new(NUM_CACHE_SHARDS * 64));
        let deletions = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for t in 0..8u64 {
            let cache = cache.clone();
            let deletions = deletions.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..2000u64 {
                    let key = format!("k{}", (t * 31 + i) % 256).into_bytes();
                    match i % 3 {
                        0 => {
                            let h = cache.insert(
                                &key,
                                Box::new(i),
                                1 + (i as usize % 4),
                                counting_deleter(&deletions),
                            );
                            cache.release(h);
                        }
                        1 => {
                            if let Some(h) = cache.lookup(&key) {
                                assert!(h.value_as::<u64>().is_some());
                                cache.release(h);
                            }
                        }
                        _ => cache.erase(&key),
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.usage() <= NUM_CACHE_SHARDS * 64);
    }
}
