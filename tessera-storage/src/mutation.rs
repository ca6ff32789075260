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

//! Per-row mutation chains
//!
//! Each row in the write buffer carries a singly linked list of mutation
//! records, appended at the tail with a release-store CAS so a concurrent
//! reader walking from the head either sees a fully initialized record or
//! does not see it at all. Records are immutable once linked and live in the
//! row's arena, so no reclamation is needed.
//!
//! Physical link order is append order. Replay order is *timestamp* order:
//! multiple writers can race onto the same row, so readers collect the chain
//! and stable-sort by timestamp (ties keep link order).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::arena::Arena;
use crate::mvcc::Timestamp;

/// One arena-resident mutation record. The encoded change list is stored
/// inline, immediately after the header.
#[repr(C)]
pub struct Mutation {
    timestamp: Timestamp,
    changelist_len: u32,
    next: AtomicPtr<Mutation>,
}

impl Mutation {
    /// Allocates a record in `arena` holding a copy of `changelist`.
    /// `None` on arena exhaustion.
    pub fn create_in_arena(
        arena: &Arena,
        timestamp: Timestamp,
        changelist: &[u8],
    ) -> Option<NonNull<Mutation>> {
        let total = std::mem::size_of::<Mutation>() + changelist.len();
        let raw = arena.alloc(total)?;
        unsafe {
            let header = raw.as_ptr() as *mut Mutation;
            header.write(Mutation {
                timestamp,
                changelist_len: changelist.len() as u32,
                next: AtomicPtr::new(std::ptr::null_mut()),
            });
            std::ptr::copy_nonoverlapping(
                changelist.as_ptr(),
                raw.as_ptr().add(std::mem::size_of::<Mutation>()),
                changelist.len(),
            );
            Some(NonNull::new_unchecked(header))
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The encoded change list carried by this record.
    #[inline]
    pub fn changelist(&self) -> &[u8] {
        unsafe {
            let base = (self as *const Mutation as *const u8).add(std::mem::size_of::<Mutation>());
            std::slice::from_raw_parts(base, self.changelist_len as usize)
        }
    }

    /// Next record in physical link order.
    #[inline]
    pub fn next(&self) -> Option<&Mutation> {
        let ptr = self.next.load(Ordering::Acquire);
        unsafe { ptr.as_ref() }
    }

    /// Publishes `node` at the tail of the list rooted at `head`. The
    /// linking store uses release ordering; the record's fields must be
    /// fully written before this is called (guaranteed by
    /// [`Mutation::create_in_arena`]).
    pub fn append_to_list_atomic(head: &AtomicPtr<Mutation>, node: NonNull<Mutation>) {
        let mut link = head;
        loop {
            match link.compare_exchange(
                std::ptr::null_mut(),
                node.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                // Lost the race; chase the new tail.
                Err(tail) => link = unsafe { &(*tail).next },
            }
        }
    }
}

/// Walks the chain rooted at `head` and returns the records in replay
/// order: ascending timestamp, ties in link order.
pub fn collect_in_timestamp_order<'a>(head: &'a AtomicPtr<Mutation>) -> Vec<&'a Mutation> {
    let mut out = Vec::new();
    let mut cur = head.load(Ordering::Acquire);
    while let Some(m) = unsafe { cur.as_ref() } {
        out.push(m);
        cur = m.next.load(Ordering::Acquire);
    }
    out.sort_by_key(|m| m.timestamp);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_tracker::{MemTracker, NO_LIMIT};
    use std::sync::Arc;

    fn arena() -> Arena {
        Arena::new(MemTracker::create(NO_LIMIT, "mutation-test", None))
    }

    #[test]
    fn test_create_and_read_back() {
        let arena = arena();
        let m = Mutation::create_in_arena(&arena, 42, b"payload").unwrap();
        let m = unsafe { m.as_ref() };
        assert_eq!(m.timestamp(), 42);
        assert_eq!(m.changelist(), b"payload");
        assert!(m.next().is_none());
    }

    #[test]
    fn test_append_preserves_link_order() {
        let arena = arena();
        let head = AtomicPtr::new(std::ptr::null_mut());
        for ts in [10u64, 30, 20] {
            let m = Mutation::create_in_arena(&arena, ts, b"x").unwrap();
            Mutation::append_to_list_atomic(&head, m);
        }
        let mut link_order = Vec::new();
        let mut cur = unsafe { head.load(Ordering::Acquire).as_ref() };
        while let Some(m) = cur {
            link_order.push(m.timestamp());
            cur = m.next();
        }
        assert_eq!(link_order, vec![10, 30, 20]);
    }

    #[test]
    fn test_replay_order_is_by_timestamp() {
        let arena = arena();
        let head = AtomicPtr::new(std::ptr::null_mut());
        for ts in [10u64, 30, 20, 30] {
            let payload = format!("@{}", ts);
            let m = Mutation::create_in_arena(&arena, ts, payload.as_bytes()).unwrap();
            Mutation::append_to_list_atomic(&head, m);
        }
        let replay: Vec<u64> = collect_in_timestamp_order(&head)
            .iter()
            .map(|m| m.timestamp())
            .collect();
        assert_eq!(replay, vec![10, 20, 30, 30]);
    }

    #[test]
    fn test_concurrent_append() {
        let arena = Arc::new(arena());
        let head = Arc::new(AtomicPtr::new(std::ptr::null_mut()));
        let mut handles = vec![];
        for t in 0..4u64 {
            let arena = arena.clone();
            let head = head.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u64 {
                    let ts = t * 1000 + i;
                    let m = Mutation::create_in_arena(&arena, ts, &ts.to_le_bytes()).unwrap();
                    Mutation::append_to_list_atomic(&head, m);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let collected = collect_in_timestamp_order(&head);
        assert_eq!(collected.len(), 4000);
        // Every record is fully initialized and sorted by timestamp.
        let mut prev = 0u64;
        for m in collected {
            assert!(m.timestamp() >= prev);
            assert_eq!(m.changelist(), &m.timestamp().to_le_bytes());
            prev = m.timestamp();
        }
    }
}
