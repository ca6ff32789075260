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

//! Hierarchical memory tracking
//!
//! A tree of counters, one per consumer, where every consumed byte bubbles
//! up to the root. Each node may carry a limit; allocators probe the chain
//! with [`MemTracker::try_consume`] before committing memory. The write
//! buffer's throttling contract and the block cache's capacity accounting
//! both hang off this tree.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

/// No limit.
pub const NO_LIMIT: i64 = -1;

/// One node in the tracker tree.
pub struct MemTracker {
    id: String,
    limit: i64,
    consumption: AtomicI64,
    parent: Option<Arc<MemTracker>>,
    children: DashMap<String, Weak<MemTracker>>,
}

impl MemTracker {
    /// Creates (or returns) the tracker `id` under `parent`. `limit` of
    /// [`NO_LIMIT`] means unlimited. Re-creating an existing live child
    /// returns it unchanged.
    pub fn create(limit: i64, id: impl Into<String>, parent: Option<&Arc<MemTracker>>) -> Arc<MemTracker> {
        let id = id.into();
        if let Some(parent) = parent {
            if let Some(existing) = parent.children.get(&id).and_then(|w| w.upgrade()) {
                return existing;
            }
            let tracker = Arc::new(MemTracker {
                id: id.clone(),
                limit,
                consumption: AtomicI64::new(0),
                parent: Some(parent.clone()),
                children: DashMap::new(),
            });
            parent.children.insert(id, Arc::downgrade(&tracker));
            tracker
        } else {
            Arc::new(MemTracker {
                id,
                limit,
                consumption: AtomicI64::new(0),
                parent: None,
                children: DashMap::new(),
            })
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn limit(&self) -> i64 {
        self.limit
    }

    #[inline]
    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Relaxed)
    }

    /// Records `bytes` against this tracker and every ancestor.
    pub fn consume(&self, bytes: i64) {
        debug_assert!(bytes >= 0);
        let mut node = Some(self);
        while let Some(t) = node {
            t.consumption.fetch_add(bytes, Ordering::Relaxed);
            node = t.parent.as_deref();
        }
    }

    /// Releases `bytes` from this tracker and every ancestor, saturating
    /// at zero (over-release is an accounting bug upstream).
    pub fn release(&self, bytes: i64) {
        debug_assert!(bytes >= 0);
        let mut node = Some(self);
        while let Some(t) = node {
            let prev = t.consumption.fetch_sub(bytes, Ordering::Relaxed);
            if prev < bytes {
                t.consumption.fetch_add(bytes - prev, Ordering::Relaxed);
            }
            node = t.parent.as_deref();
        }
    }

    /// Consumes `bytes` iff no tracker in the ancestor chain would exceed
    /// its limit. Best-effort under concurrency: a racing consumer can push
    /// the chain transiently past a limit, which callers tolerate.
    pub fn try_consume(&self, bytes: i64) -> bool {
        debug_assert!(bytes >= 0);
        let mut node = Some(self);
        while let Some(t) = node {
            if t.limit >= 0 && t.consumption() + bytes > t.limit {
                return false;
            }
            node = t.parent.as_deref();
        }
        self.consume(bytes);
        true
    }

    pub fn limit_exceeded(&self) -> bool {
        self.limit >= 0 && self.consumption() > self.limit
    }

    /// Bytes remaining under the tightest limit in the ancestor chain.
    pub fn spare_capacity(&self) -> i64 {
        let mut spare = i64::MAX;
        let mut node = Some(self);
        while let Some(t) = node {
            if t.limit >= 0 {
                spare = spare.min(t.limit - t.consumption());
            }
            node = t.parent.as_deref();
        }
        spare
    }

    /// Live children of this tracker.
    pub fn child_trackers(&self) -> Vec<Arc<MemTracker>> {
        self.children
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }
}

impl std::fmt::Debug for MemTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTracker")
            .field("id", &self.id)
            .field("limit", &self.limit)
            .field("consumption", &self.consumption())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_propagates_to_parent() {
        let root = MemTracker::create(NO_LIMIT, "root", None);
        let child = MemTracker::create(NO_LIMIT, "child", Some(&root));
        let grandchild = MemTracker::create(NO_LIMIT, "grandchild", Some(&child));

        grandchild.consume(100);
        assert_eq!(grandchild.consumption(), 100);
        assert_eq!(child.consumption(), 100);
        assert_eq!(root.consumption(), 100);

        grandchild.release(60);
        assert_eq!(root.consumption(), 40);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let root = MemTracker::create(NO_LIMIT, "root", None);
        root.consume(10);
        root.release(100);
        assert_eq!(root.consumption(), 0);
    }

    #[test]
    fn test_try_consume_respects_ancestor_limit() {
        let root = MemTracker::create(100, "root", None);
        let child = MemTracker::create(NO_LIMIT, "child", Some(&root));

        assert!(child.try_consume(80));
        assert!(!child.try_consume(30));
        assert_eq!(root.consumption(), 80);
        assert_eq!(child.spare_capacity(), 20);
    }

    #[test]
    fn test_create_returns_existing_child() {
        let root = MemTracker::create(NO_LIMIT, "root", None);
        let a = MemTracker::create(NO_LIMIT, "shard", Some(&root));
        let b = MemTracker::create(NO_LIMIT, "shard", Some(&root));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(root.child_trackers().len(), 1);
    }

    #[test]
    fn test_subtree_reports_zero_after_drop() {
        let root = MemTracker::create(NO_LIMIT, "root", None);
        {
            let child = MemTracker::create(NO_LIMIT, "child", Some(&root));
            child.consume(512);
            assert_eq!(root.consumption(), 512);
            child.release(512);
        }
        assert_eq!(root.consumption(), 0);
        assert!(root.child_trackers().is_empty());
    }

    #[test]
    fn test_concurrent_consume() {
        let root = MemTracker::create(NO_LIMIT, "root", None);
        let mut handles = vec![];
        for _ in 0..8 {
            let root = root.clone();
            handles.push(std::thread::spawn(move || {
                let child = MemTracker::create(NO_LIMIT, "worker", Some(&root));
                for _ in 0..1000 {
                    child.consume(3);
                    child.release(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(root.consumption(), 8 * 1000 * 2);
    }
}
