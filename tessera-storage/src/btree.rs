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

//! Ordered concurrent map over encoded keys
//!
//! The ordering substrate of the write buffer: byte-lexicographic keys,
//! fixed-size `Copy` values, no removal (deleted rows stay resident as
//! ghosts). The structure is a sorted directory of versioned leaves:
//!
//! - **Writers** locate a leaf through the directory (brief read lock),
//!   then serialize on that leaf's mutex. Leaf mutation runs under a seqlock
//!   version: odd while in progress, even when stable. A full leaf is sealed
//!   and split into two fresh leaves swapped into the directory under the
//!   directory write lock, which is held only for the swap.
//! - **Readers** never take the leaf mutex. They snapshot a leaf's entries
//!   optimistically and retry when the version moved underneath them.
//!
//! Writers on distinct leaves proceed in parallel. Readers never block
//! writers. There is no cross-leaf ordering promise; scans are per-leaf
//! optimistic snapshots.
//!
//! Keys are copied into the tree's arena, so entries are `Copy` pairs of
//! `(arena slice, value)` and leaf snapshots are cheap memcpys. Values may
//! point at state that keeps changing after insertion (a row's redo head);
//! readers tolerate that by chasing such pointers atomically.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use tessera_core::{Result, TesseraError};

use crate::arena::Arena;

/// Entries per leaf. Small enough that a snapshot copy is a couple of cache
/// lines, large enough that the directory stays shallow.
pub const LEAF_CAPACITY: usize = 16;

/// A byte slice resident in the tree's arena. Valid for the arena lifetime,
/// which is at least the tree lifetime.
#[derive(Clone, Copy)]
pub struct KeySlice {
    ptr: NonNull<u8>,
    len: u32,
}

impl KeySlice {
    fn copy_into(arena: &Arena, key: &[u8]) -> Option<KeySlice> {
        let ptr = arena.alloc_copy(key)?;
        Some(KeySlice {
            ptr,
            len: key.len() as u32,
        })
    }

    /// # Safety
    /// The arena backing this slice must still be alive.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize)
    }
}

unsafe impl Send for KeySlice {}
unsafe impl Sync for KeySlice {}

#[derive(Clone, Copy)]
struct Entry<V: Copy> {
    key: KeySlice,
    value: V,
}

/// One versioned leaf. `version` follows the seqlock protocol: odd while a
/// writer is mutating, even when stable. `count` only grows; entries below
/// it are always initialized once the version is even.
struct Leaf<V: Copy> {
    /// Inclusive lower bound of this leaf's key space. Immutable.
    lower_key: Vec<u8>,
    version: AtomicU64,
    count: AtomicUsize,
    entries: UnsafeCell<[MaybeUninit<Entry<V>>; LEAF_CAPACITY]>,
    /// Writer serialization. In an `Arc` so cursors can hold owned guards.
    lock: Arc<Mutex<()>>,
    /// Set once this leaf has been replaced by a split.
    sealed: AtomicBool,
}

unsafe impl<V: Copy + Send> Send for Leaf<V> {}
unsafe impl<V: Copy + Send> Sync for Leaf<V> {}

impl<V: Copy> Leaf<V> {
    fn empty(lower_key: Vec<u8>) -> Arc<Leaf<V>> {
        Arc::new(Leaf {
            lower_key,
            version: AtomicU64::new(0),
            count: AtomicUsize::new(0),
            entries: UnsafeCell::new([MaybeUninit::uninit(); LEAF_CAPACITY]),
            lock: Arc::new(Mutex::new(())),
            sealed: AtomicBool::new(false),
        })
    }

    /// Builds a leaf pre-filled with `entries`. Used by splits.
    fn with_entries(lower_key: Vec<u8>, entries: &[Entry<V>]) -> Arc<Leaf<V>> {
        debug_assert!(entries.len() <= LEAF_CAPACITY);
        let leaf = Leaf::empty(lower_key);
        {
            let slots = unsafe { &mut *leaf.entries.get() };
            for (i, e) in entries.iter().enumerate() {
                slots[i] = MaybeUninit::new(*e);
            }
        }
        leaf.count.store(entries.len(), Ordering::Release);
        leaf
    }

    /// Binary search over live entries. Caller must hold the writer lock.
    fn write_search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        let n = self.count.load(Ordering::Relaxed);
        let entries = unsafe { &*self.entries.get() };
        entries[..n].binary_search_by(|e| {
            let ek = unsafe { e.assume_init_ref().key.as_slice() };
            ek.cmp(key)
        })
    }

    /// Inserts `entry` at `idx`, shifting the tail right. Caller must hold
    /// the writer lock and have room.
    fn insert_at(&self, idx: usize, entry: Entry<V>) {
        let n = self.count.load(Ordering::Relaxed);
        debug_assert!(n < LEAF_CAPACITY && idx <= n);
        self.version.fetch_add(1, Ordering::AcqRel);
        {
            let entries = unsafe { &mut *self.entries.get() };
            for i in (idx..n).rev() {
                entries[i + 1] = entries[i];
            }
            entries[idx] = MaybeUninit::new(entry);
        }
        self.count.store(n + 1, Ordering::Release);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Optimistic consistent copy of this leaf's entries.
    fn snapshot(&self) -> Vec<Entry<V>> {
        let mut spins = 0u32;
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & 1 == 1 {
                // A writer is mid-mutation; wait for it to publish.
                spins += 1;
                if spins > 1 << 12 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
                continue;
            }
            let n = self.count.load(Ordering::Acquire).min(LEAF_CAPACITY);
            let mut raw: Vec<MaybeUninit<Entry<V>>> = Vec::with_capacity(n);
            let base = self.entries.get() as *const MaybeUninit<Entry<V>>;
            for i in 0..n {
                raw.push(unsafe { std::ptr::read(base.add(i)) });
            }
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == v1 {
                // Version unchanged: the copied prefix was fully initialized
                // and not concurrently mutated.
                return raw
                    .into_iter()
                    .map(|e| unsafe { e.assume_init() })
                    .collect();
            }
            spins += 1;
        }
    }

    /// Splits a full leaf into two fresh leaves. Caller must hold the
    /// writer lock.
    fn split(&self) -> (Arc<Leaf<V>>, Arc<Leaf<V>>) {
        let n = self.count.load(Ordering::Relaxed);
        debug_assert!(n >= 2);
        let entries = unsafe { &*self.entries.get() };
        let live: Vec<Entry<V>> = entries[..n]
            .iter()
            .map(|e| unsafe { *e.assume_init_ref() })
            .collect();
        let mid = n / 2;
        let right_lower = unsafe { live[mid].key.as_slice() }.to_vec();
        let left = Leaf::with_entries(self.lower_key.clone(), &live[..mid]);
        let right = Leaf::with_entries(right_lower, &live[mid..]);
        (left, right)
    }
}

/// Ordered concurrent map from encoded keys to `Copy` values.
pub struct MSBTree<V: Copy> {
    arena: Arc<Arena>,
    /// Sorted by `lower_key`; the first leaf's lower bound is empty, so
    /// every key lands in exactly one leaf.
    leaves: RwLock<Vec<Arc<Leaf<V>>>>,
    num_entries: AtomicUsize,
}

unsafe impl<V: Copy + Send> Send for MSBTree<V> {}
unsafe impl<V: Copy + Send> Sync for MSBTree<V> {}

impl<V: Copy> MSBTree<V> {
    pub fn new(arena: Arc<Arena>) -> MSBTree<V> {
        MSBTree {
            arena,
            leaves: RwLock::new(vec![Leaf::empty(Vec::new())]),
            num_entries: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn entry_count(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    fn locate_leaf(&self, key: &[u8]) -> Arc<Leaf<V>> {
        let leaves = self.leaves.read();
        let idx = leaves.partition_point(|l| l.lower_key.as_slice() <= key);
        debug_assert!(idx > 0);
        leaves[idx - 1].clone()
    }

    /// Swaps `old` for its split halves. Caller must hold `old`'s writer
    /// lock; the directory write lock is held only for the swap.
    fn publish_split(&self, old: &Arc<Leaf<V>>, left: Arc<Leaf<V>>, right: Arc<Leaf<V>>) {
        let mut leaves = self.leaves.write();
        let idx = leaves.partition_point(|l| l.lower_key < old.lower_key);
        debug_assert!(Arc::ptr_eq(&leaves[idx], old));
        leaves[idx] = left;
        leaves.insert(idx + 1, right);
        old.sealed.store(true, Ordering::Release);
    }

}

/// Two-phase write cursor: locate and lock the leaf that would hold a key,
/// inspect, then optionally install a new entry. Holding the cursor holds
/// the leaf's writer lock, so the answer to [`PreparedMutation::exists`]
/// stays true until the cursor is dropped.
pub struct PreparedMutation<V: Copy> {
    key: Vec<u8>,
    tree: Option<Arc<MSBTree<V>>>,
    leaf: Option<Arc<Leaf<V>>>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    idx: usize,
    found: bool,
    holds_odd: bool,
}

impl<V: Copy> PreparedMutation<V> {
    pub fn new(key: &[u8]) -> PreparedMutation<V> {
        PreparedMutation {
            key: key.to_vec(),
            tree: None,
            leaf: None,
            guard: None,
            idx: 0,
            found: false,
            holds_odd: false,
        }
    }

    /// Locates and locks the leaf for this cursor's key. May be called
    /// again to re-prepare, invalidating any previously returned value
    /// pointer.
    pub fn prepare(&mut self, tree: &Arc<MSBTree<V>>) {
        self.finish();
        loop {
            let leaf = tree.locate_leaf(&self.key);
            let guard = leaf.lock.lock_arc();
            if leaf.sealed.load(Ordering::Acquire) {
                // Split won the race; the directory has fresh leaves.
                drop(guard);
                continue;
            }
            match leaf.write_search(&self.key) {
                Ok(i) => {
                    self.idx = i;
                    self.found = true;
                }
                Err(i) => {
                    self.idx = i;
                    self.found = false;
                }
            }
            self.leaf = Some(leaf);
            self.guard = Some(guard);
            self.tree = Some(tree.clone());
            return;
        }
    }

    #[inline]
    pub fn exists(&self) -> bool {
        debug_assert!(self.guard.is_some(), "prepare() not called");
        self.found
    }

    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Mutable access to the existing entry's value. Bumps the leaf version
    /// so concurrent readers that snapshotted the old state retry — even
    /// when the caller never writes through the reference.
    pub fn current_mutable_value(&mut self) -> &mut V {
        assert!(self.found, "current_mutable_value on absent key");
        self.make_dirty();
        let leaf = self.leaf.as_ref().expect("prepare() not called");
        unsafe {
            let entries = &mut *leaf.entries.get();
            &mut entries[self.idx].assume_init_mut().value
        }
    }

    /// Installs a new entry for the cursor's key. Requires `!exists()`.
    /// Fails only on arena exhaustion.
    pub fn insert(&mut self, value: V) -> Result<()> {
        assert!(self.guard.is_some(), "prepare() not called");
        assert!(!self.found, "insert on existing key");
        let tree = self.tree.clone().expect("prepare() not called");
        let key_slice = KeySlice::copy_into(&tree.arena, &self.key).ok_or_else(|| {
            TesseraError::MemoryExhausted("arena exhausted copying key".into())
        })?;
        loop {
            let leaf = self.leaf.clone().expect("prepare() not called");
            if leaf.count.load(Ordering::Relaxed) < LEAF_CAPACITY {
                leaf.insert_at(
                    self.idx,
                    Entry {
                        key: key_slice,
                        value,
                    },
                );
                tree.num_entries.fetch_add(1, Ordering::Relaxed);
                self.found = true;
                return Ok(());
            }

            // Leaf is full: split while still holding its lock, lock the
            // half that will receive the key before publishing, then retry
            // the insert there. No other writer can slip in between.
            let (left, right) = leaf.split();
            let target = if right.lower_key.as_slice() <= self.key.as_slice() {
                right.clone()
            } else {
                left.clone()
            };
            let target_guard = target.lock.lock_arc();
            tree.publish_split(&leaf, left, right);
            self.guard = Some(target_guard);
            self.idx = match target.write_search(&self.key) {
                Err(i) => i,
                Ok(_) => unreachable!("key appeared during split"),
            };
            self.leaf = Some(target);
        }
    }

    fn make_dirty(&mut self) {
        if !self.holds_odd {
            if let Some(leaf) = &self.leaf {
                leaf.version.fetch_add(1, Ordering::AcqRel);
                self.holds_odd = true;
            }
        }
    }

    fn finish(&mut self) {
        if self.holds_odd {
            if let Some(leaf) = &self.leaf {
                leaf.version.fetch_add(1, Ordering::Release);
            }
            self.holds_odd = false;
        }
        self.guard = None;
        self.leaf = None;
        self.tree = None;
        self.found = false;
        self.idx = 0;
    }
}

impl<V: Copy> Drop for PreparedMutation<V> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Snapshot-per-leaf scan cursor. Tolerates concurrent inserts and splits:
/// moving past the current leaf re-locates the successor by key.
pub struct MSBTreeIter<V: Copy> {
    tree: Arc<MSBTree<V>>,
    snapshot: Vec<Entry<V>>,
    idx: usize,
    valid: bool,
}

impl<V: Copy> MSBTreeIter<V> {
    /// A fresh, unpositioned cursor; seek before reading.
    pub fn new(tree: Arc<MSBTree<V>>) -> MSBTreeIter<V> {
        MSBTreeIter {
            tree,
            snapshot: Vec::new(),
            idx: 0,
            valid: false,
        }
    }

    /// Positions at the least key `>= key`; `exact` reports equality.
    /// Returns false when no such entry exists.
    pub fn seek_at_or_after(&mut self, key: &[u8], exact: &mut bool) -> bool {
        self.position(key, true, exact)
    }

    fn position(&mut self, key: &[u8], inclusive: bool, exact: &mut bool) -> bool {
        *exact = false;
        let leaves = self.tree.leaves.read();
        let start = leaves
            .partition_point(|l| l.lower_key.as_slice() <= key)
            .max(1)
            - 1;
        for leaf in &leaves[start..] {
            let snap = leaf.snapshot();
            let pos = snap.partition_point(|e| {
                let ek = unsafe { e.key.as_slice() };
                if inclusive {
                    ek < key
                } else {
                    ek <= key
                }
            });
            if pos < snap.len() {
                *exact = inclusive && unsafe { snap[pos].key.as_slice() } == key;
                self.snapshot = snap;
                self.idx = pos;
                self.valid = true;
                return true;
            }
        }
        self.valid = false;
        false
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Current entry. Key bytes live in the tree's arena.
    pub fn get_current_entry(&self) -> (&[u8], V) {
        assert!(self.valid, "iterator not positioned");
        let e = &self.snapshot[self.idx];
        (unsafe { e.key.as_slice() }, e.value)
    }

    /// Advances to the next entry; false at end.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.idx += 1;
        if self.idx < self.snapshot.len() {
            return true;
        }
        let last = unsafe { self.snapshot[self.idx - 1].key.as_slice() }.to_vec();
        let mut exact = false;
        self.position(&last, false, &mut exact)
    }
}
