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

//! In-memory write buffer (MemRowSet)
//!
//! A single tablet's ordered, mutation-aware buffer of recent writes. Rows
//! are inserted once and never rewritten; all subsequent changes hang off
//! the row as a redo chain replayed against an MVCC snapshot at read time.
//! The buffer is volatile: it accumulates until an external flusher writes
//! it to disk and drops it, arena and all.
//!
//! A deleted row stays resident as a *ghost* so that a later insert of the
//! same key becomes a REINSERT mutation on the original entry instead of a
//! second tree entry. Ghosts answer "not present" to probes.
//!
//! ## Row memory layout
//!
//! One arena allocation per row:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────┐
//! │ RowHeader                    │ row body                         │
//! │  insertion_timestamp: u64    │  slots: 16 bytes × ncols         │
//! │  redo_head: AtomicPtr        │  null bitmap: ⌈ncols/8⌉ bytes    │
//! │  body_len: u32               │                                  │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Fixed-width slots hold the value bits; variable-length slots hold a
//! (pointer, length) pair into the same arena. The body is immutable after
//! insert; only `redo_head` ever changes.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use tessera_core::key::{encode_comparable_key, encode_key_cells, KeyBuf};
use tessera_core::{
    ChangeListDecoder, ChangeListEncoder, ColumnType, Datum, OpId, Result, Row, Schema,
    TesseraError,
};

use crate::anchor::{AnchorRegistry, MinOpIdAnchorer};
use crate::arena::Arena;
use crate::btree::{MSBTree, MSBTreeIter, PreparedMutation};
use crate::iterator::MemRowSetIterator;
use crate::mem_tracker::{MemTracker, NO_LIMIT};
use crate::mutation::{collect_in_timestamp_order, Mutation};
use crate::mvcc::{MvccSnapshot, Timestamp};

const SLOT_SIZE: usize = 16;

/// Fixed per-row header preceding the packed body in the arena.
#[repr(C)]
pub struct RowHeader {
    insertion_timestamp: Timestamp,
    redo_head: AtomicPtr<Mutation>,
    body_len: u32,
}

/// Value stored in the ordered tree: a pointer to an arena-resident row.
/// Valid for the lifetime of the owning buffer's arena.
#[derive(Clone, Copy)]
pub struct RowHandle(NonNull<RowHeader>);

unsafe impl Send for RowHandle {}
unsafe impl Sync for RowHandle {}

/// Borrowed view of one buffered row.
pub struct MRSRow<'a> {
    schema: &'a Schema,
    header: &'a RowHeader,
}

impl<'a> MRSRow<'a> {
    pub(crate) fn new(mrs: &'a MemRowSet, handle: RowHandle) -> MRSRow<'a> {
        MRSRow {
            schema: &mrs.schema,
            // Arena memory outlives the MemRowSet borrow.
            header: unsafe { handle.0.as_ref() },
        }
    }

    #[inline]
    pub fn insertion_timestamp(&self) -> Timestamp {
        self.header.insertion_timestamp
    }

    #[inline]
    pub(crate) fn redo_head(&self) -> &'a AtomicPtr<Mutation> {
        &self.header.redo_head
    }

    fn body(&self) -> &'a [u8] {
        unsafe {
            let base =
                (self.header as *const RowHeader as *const u8).add(std::mem::size_of::<RowHeader>());
            std::slice::from_raw_parts(base, self.header.body_len as usize)
        }
    }

    /// Decodes the base-image value of column `idx`. Mutations are not
    /// applied here; replay is the reader's job.
    pub fn cell(&self, idx: usize) -> Datum {
        decode_body_cell(self.body(), self.schema, idx)
    }

    /// Replays the redo chain to decide whether the row's latest state is
    /// deleted. A chain that fails to decode means a violated invariant and
    /// aborts.
    pub fn is_ghost(&self) -> bool {
        let mut is_ghost = false;
        for m in collect_in_timestamp_order(self.redo_head()) {
            let decoded = ChangeListDecoder::decode(m.changelist()).unwrap_or_else(|e| {
                panic!(
                    "failed to decode changelist @{} on buffered row: {}",
                    m.timestamp(),
                    e
                )
            });
            if decoded.is_delete() {
                debug_assert!(!is_ghost, "DELETE on already-deleted row");
                is_ghost = true;
            } else if decoded.is_reinsert() {
                debug_assert!(is_ghost, "REINSERT on live row");
                is_ghost = false;
            }
        }
        is_ghost
    }
}

fn bitmap_offset(ncols: usize) -> usize {
    ncols * SLOT_SIZE
}

fn body_size(ncols: usize) -> usize {
    ncols * SLOT_SIZE + (ncols + 7) / 8
}

/// Packs `row` into the slot/bitmap body format, relocating var-len data
/// into `arena`. `None` on arena exhaustion.
fn build_row_body(row: &Row, arena: &Arena) -> Option<Vec<u8>> {
    let ncols = row.schema().num_columns();
    let mut body = vec![0u8; body_size(ncols)];
    for (idx, value) in row.values().iter().enumerate() {
        let slot = idx * SLOT_SIZE;
        match value {
            Datum::Null => {
                body[bitmap_offset(ncols) + idx / 8] |= 1 << (idx % 8);
            }
            Datum::Bool(b) => LittleEndian::write_u64(&mut body[slot..], *b as u64),
            Datum::Int64(v) => LittleEndian::write_u64(&mut body[slot..], *v as u64),
            Datum::UInt64(v) => LittleEndian::write_u64(&mut body[slot..], *v),
            Datum::Float64(v) => LittleEndian::write_u64(&mut body[slot..], v.to_bits()),
            Datum::Text(s) => {
                let ptr = arena.alloc_copy(s.as_bytes())?;
                LittleEndian::write_u64(&mut body[slot..], ptr.as_ptr() as u64);
                LittleEndian::write_u64(&mut body[slot + 8..], s.len() as u64);
            }
            Datum::Binary(b) => {
                let ptr = arena.alloc_copy(b)?;
                LittleEndian::write_u64(&mut body[slot..], ptr.as_ptr() as u64);
                LittleEndian::write_u64(&mut body[slot + 8..], b.len() as u64);
            }
        }
    }
    Some(body)
}

fn decode_body_cell(body: &[u8], schema: &Schema, idx: usize) -> Datum {
    let ncols = schema.num_columns();
    if body[bitmap_offset(ncols) + idx / 8] & (1 << (idx % 8)) != 0 {
        return Datum::Null;
    }
    let slot = idx * SLOT_SIZE;
    let word0 = LittleEndian::read_u64(&body[slot..]);
    match schema.column(idx).ctype() {
        ColumnType::Bool => Datum::Bool(word0 != 0),
        ColumnType::Int64 => Datum::Int64(word0 as i64),
        ColumnType::UInt64 => Datum::UInt64(word0),
        ColumnType::Float64 => Datum::Float64(f64::from_bits(word0)),
        ColumnType::Text | ColumnType::Binary => {
            let len = LittleEndian::read_u64(&body[slot + 8..]) as usize;
            let bytes = if len == 0 {
                &[][..]
            } else {
                unsafe { std::slice::from_raw_parts(word0 as *const u8, len) }
            };
            if schema.column(idx).ctype() == ColumnType::Text {
                Datum::Text(String::from_utf8_lossy(bytes).into_owned())
            } else {
                Datum::Binary(bytes.to_vec())
            }
        }
    }
}

/// An encoded-key probe into a rowset.
#[derive(Debug, Clone)]
pub struct RowKeyProbe {
    encoded_key: KeyBuf,
}

impl RowKeyProbe {
    pub fn from_row(row: &Row) -> Result<RowKeyProbe> {
        let mut encoded_key = KeyBuf::new();
        encode_comparable_key(row, &mut encoded_key)?;
        Ok(RowKeyProbe { encoded_key })
    }

    pub fn from_key_cells(schema: &Schema, cells: &[Datum]) -> Result<RowKeyProbe> {
        let mut encoded_key = KeyBuf::new();
        encode_key_cells(schema, cells, &mut encoded_key)?;
        Ok(RowKeyProbe { encoded_key })
    }

    #[inline]
    pub fn encoded_key(&self) -> &[u8] {
        &self.encoded_key
    }
}

/// Per-operation probe accounting, reported up to the tablet.
#[derive(Debug, Default, Clone)]
pub struct ProbeStats {
    pub mrs_consulted: u64,
}

/// Which stores an operation landed in.
#[derive(Debug, Default, Clone)]
pub struct OperationResult {
    mutated_stores: Vec<u64>,
}

impl OperationResult {
    pub fn add_mutated_store(&mut self, id: u64) {
        self.mutated_stores.push(id);
    }

    pub fn mutated_stores(&self) -> &[u64] {
        &self.mutated_stores
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemRowSetOptions {
    /// Memory footprint (MiB) beyond which writers are slowed down.
    /// Zero disables throttling.
    pub throttle_mb: usize,
}

/// The in-memory write buffer for one tablet.
pub struct MemRowSet {
    id: u64,
    schema: Arc<Schema>,
    mem_tracker: Arc<MemTracker>,
    arena: Arc<Arena>,
    tree: Arc<MSBTree<RowHandle>>,
    anchorer: MinOpIdAnchorer,
    options: MemRowSetOptions,
    debug_insert_count: AtomicU64,
    debug_update_count: AtomicU64,
    has_logged_throttling: AtomicBool,
    /// Back-reference so iterators can keep the buffer (and its arena)
    /// alive past the caller's borrow.
    self_ref: Weak<MemRowSet>,
}

impl MemRowSet {
    pub fn new(
        id: u64,
        schema: Arc<Schema>,
        anchor_registry: Arc<AnchorRegistry>,
        parent_tracker: Option<&Arc<MemTracker>>,
        options: MemRowSetOptions,
    ) -> Result<Arc<MemRowSet>> {
        if !schema.has_column_ids() {
            return Err(TesseraError::InvalidArgument(
                "memrowset schema must have column ids assigned".into(),
            ));
        }
        let tracker_id = match parent_tracker {
            Some(parent) => format!("{}-MemRowSet-{}", parent.id(), id),
            None => format!("MemRowSet-{}", id),
        };
        let mem_tracker = MemTracker::create(NO_LIMIT, tracker_id, parent_tracker);
        let arena = Arc::new(Arena::new(mem_tracker.clone()));
        let tree = Arc::new(MSBTree::new(arena.clone()));
        let anchorer = MinOpIdAnchorer::new(anchor_registry, format!("MemRowSet-{}", id));
        Ok(Arc::new_cyclic(|self_ref| MemRowSet {
            id,
            schema,
            mem_tracker,
            arena,
            tree,
            anchorer,
            options,
            debug_insert_count: AtomicU64::new(0),
            debug_update_count: AtomicU64::new(0),
            has_logged_throttling: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    #[inline]
    pub(crate) fn tree(&self) -> &Arc<MSBTree<RowHandle>> {
        &self.tree
    }

    pub fn entry_count(&self) -> usize {
        self.tree.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Bytes retained by this buffer, the input to flush decisions and
    /// write throttling.
    pub fn memory_footprint(&self) -> usize {
        self.arena.memory_footprint()
    }

    pub fn debug_insert_count(&self) -> u64 {
        self.debug_insert_count.load(Ordering::Relaxed)
    }

    pub fn debug_update_count(&self) -> u64 {
        self.debug_update_count.load(Ordering::Relaxed)
    }

    /// Inserts a new row at `timestamp`.
    ///
    /// If a live row with the same key exists, returns `AlreadyPresent`.
    /// If the existing row is a ghost, the insert becomes a REINSERT
    /// mutation on its redo chain.
    pub fn insert(&self, timestamp: Timestamp, row: &Row, op_id: OpId) -> Result<()> {
        if !row.schema().has_column_ids() {
            return Err(TesseraError::InvalidArgument(
                "row schema must have column ids".into(),
            ));
        }
        if **row.schema() != *self.schema {
            return Err(TesseraError::InvalidArgument(
                "row schema does not match memrowset schema".into(),
            ));
        }

        let mut key_buf = KeyBuf::new();
        encode_comparable_key(row, &mut key_buf)?;

        let mut prepared = PreparedMutation::new(&key_buf);
        prepared.prepare(&self.tree);

        if prepared.exists() {
            // A resident entry is fine if it is a ghost: the row was
            // deleted and this insert revives it in place.
            let handle = *prepared.current_mutable_value();
            if !MRSRow::new(self, handle).is_ghost() {
                return Err(TesseraError::AlreadyPresent(
                    "entry already present in memrowset".into(),
                ));
            }
            self.reinsert(timestamp, row, handle)?;
        } else {
            let handle = self.new_row_in_arena(timestamp, row)?;
            prepared.insert(handle)?;
        }
        drop(prepared);

        self.anchorer.anchor_if_minimum(op_id);
        self.debug_insert_count.fetch_add(1, Ordering::Relaxed);
        self.slow_mutators();
        Ok(())
    }

    /// Revives a ghost row by appending a REINSERT carrying the new row
    /// image. The original body is left untouched; readers reconstruct the
    /// latest state by replay.
    fn reinsert(&self, timestamp: Timestamp, row: &Row, handle: RowHandle) -> Result<()> {
        let mut encoder = ChangeListEncoder::new();
        encoder.set_to_reinsert(row)?;
        let mutation = Mutation::create_in_arena(&self.arena, timestamp, encoder.as_bytes())
            .ok_or_else(|| {
                TesseraError::MemoryExhausted("arena exhausted allocating reinsert".into())
            })?;
        let header = unsafe { handle.0.as_ref() };
        Mutation::append_to_list_atomic(&header.redo_head, mutation);
        Ok(())
    }

    /// Appends an encoded change list to the row `probe` points at.
    /// Ghost rows report `NotFound` like absent rows do.
    pub fn mutate_row(
        &self,
        timestamp: Timestamp,
        probe: &RowKeyProbe,
        changelist: &[u8],
        op_id: OpId,
        stats: &mut ProbeStats,
        result: &mut OperationResult,
    ) -> Result<()> {
        {
            let mut prepared = PreparedMutation::new(probe.encoded_key());
            prepared.prepare(&self.tree);

            if !prepared.exists() {
                return Err(TesseraError::NotFound("not in memrowset".into()));
            }
            let handle = *prepared.current_mutable_value();
            let row = MRSRow::new(self, handle);
            if row.is_ghost() {
                return Err(TesseraError::NotFound("not in memrowset (ghost)".into()));
            }

            let mutation = Mutation::create_in_arena(&self.arena, timestamp, changelist)
                .ok_or_else(|| {
                    TesseraError::MemoryExhausted("arena exhausted allocating mutation".into())
                })?;
            Mutation::append_to_list_atomic(row.redo_head(), mutation);
            result.add_mutated_store(self.id);
        }

        stats.mrs_consulted += 1;
        self.anchorer.anchor_if_minimum(op_id);
        self.debug_update_count.fetch_add(1, Ordering::Relaxed);

        // Throttle outside the tree critical section so readers are not
        // slowed down.
        self.slow_mutators();
        Ok(())
    }

    /// True iff a live (non-ghost) row with this key is buffered.
    pub fn check_row_present(&self, probe: &RowKeyProbe, stats: &mut ProbeStats) -> Result<bool> {
        stats.mrs_consulted += 1;

        let mut prepared = PreparedMutation::new(probe.encoded_key());
        prepared.prepare(&self.tree);
        if !prepared.exists() {
            return Ok(false);
        }
        // Going through the write cursor bumps the leaf version and makes
        // concurrent readers retry even though nothing is written here.
        // Kept: presence checks only run on the (rare) update path and the
        // short lock keeps the answer stable while we inspect the chain.
        let handle = *prepared.current_mutable_value();
        Ok(!MRSRow::new(self, handle).is_ghost())
    }

    /// Schema change is handled by flushing and re-creating the buffer from
    /// the outside; in place it is unsupported.
    pub fn alter_schema(&self, _schema: &Schema) -> Result<()> {
        Err(TesseraError::NotSupported(
            "AlterSchema not supported by MemRowSet".into(),
        ))
    }

    /// Key bounds are only known for on-disk rowsets.
    pub fn get_bounds(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Err(TesseraError::NotSupported(
            "GetBounds not supported by MemRowSet".into(),
        ))
    }

    /// Creates a snapshot scan over this buffer. `projection` names the
    /// output columns by id; `snap` decides visibility. Call
    /// [`crate::iterator::MemRowSetIterator::init`] before fetching.
    pub fn new_iterator(
        &self,
        projection: &Arc<Schema>,
        snap: MvccSnapshot,
    ) -> Result<MemRowSetIterator> {
        let mrs = self
            .self_ref
            .upgrade()
            .expect("a live &MemRowSet implies a live Arc");
        Ok(MemRowSetIterator::new(mrs, projection.clone(), snap))
    }

    pub fn min_anchored_op_id(&self) -> Option<OpId> {
        self.anchorer.anchored()
    }

    /// Called once the buffer's contents are durably flushed; the log may
    /// then truncate past our writes.
    pub fn flush_complete(&self) {
        self.anchorer.release();
    }

    fn new_row_in_arena(&self, timestamp: Timestamp, row: &Row) -> Result<RowHandle> {
        let oom =
            || TesseraError::MemoryExhausted("arena exhausted allocating row".into());
        let body = build_row_body(row, &self.arena).ok_or_else(oom)?;
        let total = std::mem::size_of::<RowHeader>() + body.len();
        let raw = self.arena.alloc(total).ok_or_else(oom)?;
        unsafe {
            let header = raw.as_ptr() as *mut RowHeader;
            header.write(RowHeader {
                insertion_timestamp: timestamp,
                redo_head: AtomicPtr::new(std::ptr::null_mut()),
                body_len: body.len() as u32,
            });
            std::ptr::copy_nonoverlapping(
                body.as_ptr(),
                raw.as_ptr().add(std::mem::size_of::<RowHeader>()),
                body.len(),
            );
            Ok(RowHandle(NonNull::new_unchecked(header)))
        }
    }

    /// Linear back-pressure once the buffer grows past the configured
    /// threshold: sleep one microsecond per 512 KiB of overage. The first
    /// breach logs a warning, once per buffer.
    fn slow_mutators(&self) {
        if self.options.throttle_mb == 0 {
            return;
        }
        let threshold = self.options.throttle_mb * 1024 * 1024;
        let footprint = self.memory_footprint();
        if footprint > threshold {
            let over = footprint - threshold;
            if !self.has_logged_throttling.swap(true, Ordering::Relaxed) {
                warn!(mrs_id = self.id, footprint, "throttling memrowset write rate");
            }
            std::thread::sleep(Duration::from_micros((over / 1024 / 512) as u64));
        }
    }

    /// Renders every buffered row with its redo chain. Debug/test aid.
    pub fn debug_dump(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut iter = MSBTreeIter::new(self.tree.clone());
        let mut exact = false;
        if !iter.seek_at_or_after(&[], &mut exact) {
            return Ok(lines);
        }
        loop {
            let (_key, handle) = iter.get_current_entry();
            let row = MRSRow::new(self, handle);
            let cells: Vec<String> = self
                .schema
                .columns()
                .iter()
                .enumerate()
                .map(|(i, col)| format!("{}={}", col.name(), row.cell(i)))
                .collect();
            let mut mutations = Vec::new();
            for m in collect_in_timestamp_order(row.redo_head()) {
                let decoded = ChangeListDecoder::decode(m.changelist())?;
                mutations.push(format!("@{} {}", m.timestamp(), decoded));
            }
            lines.push(format!(
                "@{}: row ({}) mutations=[{}]",
                row.insertion_timestamp(),
                cells.join(", "),
                mutations.join(", ")
            ));
            if !iter.next() {
                break;
            }
        }
        Ok(lines)
    }
}

impl std::fmt::Debug for MemRowSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRowSet")
            .field("id", &self.id)
            .field("entries", &self.entry_count())
            .field("footprint", &self.memory_footprint())
            .finish()
    }
}
