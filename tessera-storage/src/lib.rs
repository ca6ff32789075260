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

//! Tessera Storage
//!
//! The tablet's in-memory write path and block cache:
//!
//! - **MemRowSet**: an arena-backed, ordered, mutation-aware buffer of
//!   recent writes. Inserts and updates proceed concurrently with
//!   snapshot-consistent MVCC scans; the buffer is volatile until an
//!   external flusher persists it.
//! - **Sharded LRU cache**: a reference-counted, memory-bounded eviction
//!   cache consumed by read paths.
//!
//! Supporting pieces: a hierarchical memory tracker, a thread-safe bump
//! arena, an ordered concurrent map with optimistic leaf versioning,
//! lock-free per-row mutation chains, MVCC snapshots, and an op-id anchor
//! registry for log retention.
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_core::{Column, ColumnId, ColumnType, Datum, OpId, Row, Schema};
//! use tessera_storage::anchor::AnchorRegistry;
//! use tessera_storage::iterator::RowBlock;
//! use tessera_storage::memrowset::{MemRowSet, MemRowSetOptions};
//! use tessera_storage::mvcc::MvccSnapshot;
//!
//! let schema = Arc::new(Schema::new(vec![
//!     Column::with_id(ColumnId(0), "pk", ColumnType::UInt64, false),
//!     Column::with_id(ColumnId(1), "v", ColumnType::Text, true),
//! ], 1).unwrap());
//!
//! let mrs = MemRowSet::new(1, schema.clone(), AnchorRegistry::new(), None,
//!                          MemRowSetOptions::default()).unwrap();
//! let row = Row::new(schema.clone(),
//!                    vec![Datum::UInt64(1), Datum::Text("a".into())]).unwrap();
//! mrs.insert(10, &row, OpId::new(1, 1)).unwrap();
//!
//! let mut iter = mrs.new_iterator(&schema, MvccSnapshot::committed_up_to(100)).unwrap();
//! iter.init(None).unwrap();
//! let mut block = RowBlock::new(schema, 128);
//! iter.next_block(&mut block).unwrap();
//! assert_eq!(block.selected_rows().len(), 1);
//! ```

pub mod anchor;
pub mod arena;
pub mod btree;
pub mod cache;
pub mod iterator;
pub mod mem_tracker;
pub mod memrowset;
pub mod mutation;
pub mod mvcc;

pub use anchor::{AnchorRegistry, MinOpIdAnchorer};
pub use arena::Arena;
pub use btree::{MSBTree, MSBTreeIter, PreparedMutation};
pub use cache::{CacheDeleter, CacheHandle, CacheValue, ShardedLruCache, NUM_CACHE_SHARDS};
pub use iterator::{EncodedKeyRange, MemRowSetIterator, RowBlock, ScanSpec, SelectionVector};
pub use mem_tracker::{MemTracker, NO_LIMIT};
pub use memrowset::{
    MRSRow, MemRowSet, MemRowSetOptions, OperationResult, ProbeStats, RowKeyProbe,
};
pub use mutation::Mutation;
pub use mvcc::{MvccSnapshot, Timestamp};
