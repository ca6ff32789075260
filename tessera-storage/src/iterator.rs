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

//! Snapshot-consistent scans over the write buffer
//!
//! The iterator walks the ordered tree in key order, block by block. Each
//! fetched row is projected into the output schema, then its redo chain is
//! replayed: mutations committed in the scan's snapshot apply in timestamp
//! order, uncommitted ones are skipped individually. Rows whose insertion
//! timestamp is uncommitted keep their slot in the block but are marked
//! unselected, preserving block alignment for callers that index by slot.
//!
//! Scan specs push encoded key ranges down into the seek: the effective
//! range is the intersection (maximum lower bound, minimum upper bound).

use std::sync::Arc;

use tracing::debug;

use tessera_core::key::{encode_key_cells, KeyBuf};
use tessera_core::{
    ChangeListDecoder, ChangeType, Datum, DeltaProjection, Projection, Result, Schema,
    TesseraError,
};

use crate::btree::MSBTreeIter;
use crate::memrowset::{MRSRow, MemRowSet, RowHandle};
use crate::mvcc::MvccSnapshot;

/// Half-open encoded key range `[lower, upper)`; either bound optional.
#[derive(Debug, Clone, Default)]
pub struct EncodedKeyRange {
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

impl EncodedKeyRange {
    pub fn new(lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Self {
        Self { lower, upper }
    }

    pub fn lower_bound(&self) -> Option<&[u8]> {
        self.lower.as_deref()
    }

    pub fn upper_bound(&self) -> Option<&[u8]> {
        self.upper.as_deref()
    }
}

/// Predicate push-down carried into a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    encoded_ranges: Vec<EncodedKeyRange>,
}

impl ScanSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_encoded_range(&mut self, range: EncodedKeyRange) {
        self.encoded_ranges.push(range);
    }

    pub fn encoded_ranges(&self) -> &[EncodedKeyRange] {
        &self.encoded_ranges
    }

    pub fn has_encoded_ranges(&self) -> bool {
        !self.encoded_ranges.is_empty()
    }
}

/// Per-block row visibility bits.
#[derive(Debug, Clone)]
pub struct SelectionVector {
    bits: Vec<bool>,
}

impl SelectionVector {
    fn new(capacity: usize) -> Self {
        Self {
            bits: vec![true; capacity],
        }
    }

    pub fn set_all_true(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = true);
    }

    #[inline]
    pub fn set_row_unselected(&mut self, idx: usize) {
        self.bits[idx] = false;
    }

    #[inline]
    pub fn set_row_selected(&mut self, idx: usize) {
        self.bits[idx] = true;
    }

    #[inline]
    pub fn is_selected(&self, idx: usize) -> bool {
        self.bits[idx]
    }

    pub fn count_selected(&self, nrows: usize) -> usize {
        self.bits[..nrows].iter().filter(|b| **b).count()
    }
}

/// A fixed-capacity batch of output rows in the projection schema. Row
/// storage is reused across blocks; [`RowBlock::reset`] clears it the way a
/// per-block arena reset would.
pub struct RowBlock {
    schema: Arc<Schema>,
    rows: Vec<Vec<Datum>>,
    nrows: usize,
    selection: SelectionVector,
}

impl RowBlock {
    pub fn new(schema: Arc<Schema>, capacity: usize) -> RowBlock {
        let ncols = schema.num_columns();
        RowBlock {
            rows: vec![vec![Datum::Null; ncols]; capacity],
            nrows: 0,
            selection: SelectionVector::new(capacity),
            schema,
        }
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn row_capacity(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn resize(&mut self, nrows: usize) {
        debug_assert!(nrows <= self.row_capacity());
        self.nrows = nrows;
    }

    /// Clears all cell storage and re-selects every slot.
    pub fn reset(&mut self) {
        for row in &mut self.rows {
            row.iter_mut().for_each(|cell| *cell = Datum::Null);
        }
        self.selection.set_all_true();
    }

    #[inline]
    pub fn row(&self, idx: usize) -> &[Datum] {
        debug_assert!(idx < self.nrows);
        &self.rows[idx]
    }

    #[inline]
    fn row_mut(&mut self, idx: usize) -> &mut Vec<Datum> {
        &mut self.rows[idx]
    }

    #[inline]
    pub fn selection(&self) -> &SelectionVector {
        &self.selection
    }

    /// Selected rows in block order; convenience for tests and debug paths.
    pub fn selected_rows(&self) -> Vec<&[Datum]> {
        (0..self.nrows)
            .filter(|i| self.selection.is_selected(*i))
            .map(|i| self.rows[i].as_slice())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Uninitialized,
    Scanning,
    Finished,
}

/// Unidirectional, snapshot-consistent scan over one write buffer.
pub struct MemRowSetIterator {
    mrs: Arc<MemRowSet>,
    projection: Arc<Schema>,
    snap: MvccSnapshot,
    iter: MSBTreeIter<RowHandle>,
    read_projection: Option<Projection>,
    delta_projection: Option<DeltaProjection>,
    upper_bound: Option<Vec<u8>>,
    state: IterState,
}

impl MemRowSetIterator {
    pub(crate) fn new(
        mrs: Arc<MemRowSet>,
        projection: Arc<Schema>,
        snap: MvccSnapshot,
    ) -> MemRowSetIterator {
        let iter = MSBTreeIter::new(mrs.tree().clone());
        MemRowSetIterator {
            mrs,
            projection,
            snap,
            iter,
            read_projection: None,
            delta_projection: None,
            upper_bound: None,
            state: IterState::Uninitialized,
        }
    }

    /// Builds the projectors, intersects any pushed key ranges, and seeks
    /// to the effective lower bound.
    pub fn init(&mut self, spec: Option<&ScanSpec>) -> Result<()> {
        debug_assert_eq!(self.state, IterState::Uninitialized);

        self.read_projection = Some(Projection::build(self.mrs.schema(), &self.projection)?);
        self.delta_projection = Some(DeltaProjection::build(&self.projection)?);

        let mut max_lower: Option<Vec<u8>> = None;
        if let Some(spec) = spec.filter(|s| s.has_encoded_ranges()) {
            for range in spec.encoded_ranges() {
                if let Some(lower) = range.lower_bound() {
                    if max_lower.as_deref().map_or(true, |m| lower > m) {
                        let mut exact = false;
                        if !self.iter.seek_at_or_after(lower, &mut exact) {
                            // The most restrictive lower bound is past the
                            // end of the buffer; nothing can match.
                            self.state = IterState::Finished;
                            return Ok(());
                        }
                        max_lower = Some(lower.to_vec());
                    }
                }
                if let Some(upper) = range.upper_bound() {
                    if self.upper_bound.as_deref().map_or(true, |u| upper < u) {
                        self.upper_bound = Some(upper.to_vec());
                    }
                }
            }
            debug!(
                mrs_id = self.mrs.id(),
                has_lower = max_lower.is_some(),
                has_upper = self.upper_bound.is_some(),
                "pushed key bounds into memrowset scan"
            );
        }

        let mut exact = false;
        match &max_lower {
            Some(lower) => {
                self.iter.seek_at_or_after(lower, &mut exact);
            }
            None => {
                self.iter.seek_at_or_after(&[], &mut exact);
            }
        }
        self.state = IterState::Scanning;
        Ok(())
    }

    /// Repositions at the least key at-or-after the given key cells. Empty
    /// cells mean "begin". `NotFound` iff a non-empty key has nothing
    /// at-or-after it.
    pub fn seek_at_or_after(&mut self, key: &[Datum], exact: &mut bool) -> Result<()> {
        debug_assert_ne!(self.state, IterState::Uninitialized, "not initialized");

        let found = if key.is_empty() {
            self.iter.seek_at_or_after(&[], exact)
        } else {
            let mut buf = KeyBuf::new();
            encode_key_cells(self.mrs.schema(), key, &mut buf)?;
            self.iter.seek_at_or_after(&buf, exact)
        };
        if found || key.is_empty() {
            Ok(())
        } else {
            Err(TesseraError::NotFound("no match in memrowset".into()))
        }
    }

    pub fn has_next(&self) -> bool {
        self.state == IterState::Scanning && self.iter.is_valid()
    }

    /// Fills `dst` with the next batch. At the end of iteration returns
    /// `NotFound("end of iter")` with an empty block.
    pub fn next_block(&mut self, dst: &mut RowBlock) -> Result<()> {
        debug_assert_ne!(self.state, IterState::Uninitialized, "not initialized");
        if !self.iter.is_valid() {
            dst.resize(0);
            return Err(TesseraError::NotFound("end of iter".into()));
        }
        if self.state != IterState::Scanning {
            dst.resize(0);
            return Ok(());
        }
        if dst.row_capacity() == 0 {
            return Ok(());
        }

        dst.resize(dst.row_capacity());
        dst.reset();
        let fetched = self.fetch_rows(dst)?;
        debug_assert!(fetched <= dst.nrows());
        dst.resize(fetched);
        Ok(())
    }

    fn fetch_rows(&mut self, dst: &mut RowBlock) -> Result<usize> {
        let mut fetched = 0;
        loop {
            let (key, handle) = self.iter.get_current_entry();
            let key = key.to_vec();
            let row = MRSRow::new(&self.mrs, handle);

            if self.snap.is_committed(row.insertion_timestamp()) {
                if self.out_of_bounds(&key) {
                    self.state = IterState::Finished;
                    break;
                }
                self.project_row(&row, dst, fetched)?;
            } else {
                // Not yet committed in this snapshot. The slot still counts
                // so scans preserve block alignment.
                dst.selection.set_row_unselected(fetched);
            }

            fetched += 1;
            if !self.iter.next() || fetched >= dst.nrows() {
                break;
            }
        }
        Ok(fetched)
    }

    fn out_of_bounds(&self, key: &[u8]) -> bool {
        match &self.upper_bound {
            Some(upper) => key >= upper.as_slice(),
            None => false,
        }
    }

    /// Copies the base row image through the read projector, then rolls
    /// the redo chain forward for mutations committed in the snapshot.
    fn project_row(&self, row: &MRSRow<'_>, dst: &mut RowBlock, idx: usize) -> Result<()> {
        let projection = self
            .read_projection
            .as_ref()
            .expect("init() builds the read projector");
        {
            let out = dst.row_mut(idx);
            for out_idx in 0..projection.num_columns() {
                out[out_idx] = row.cell(projection.base_index(out_idx));
            }
        }
        self.apply_mutations(row, dst, idx)
    }

    fn apply_mutations(&self, row: &MRSRow<'_>, dst: &mut RowBlock, idx: usize) -> Result<()> {
        let deltas = self
            .delta_projection
            .as_ref()
            .expect("init() builds the delta projector");
        for mutation in crate::mutation::collect_in_timestamp_order(row.redo_head()) {
            // Mutations are checked individually: a later link can carry an
            // earlier timestamp when writers raced.
            if !self.snap.is_committed(mutation.timestamp()) {
                continue;
            }
            let decoded = ChangeListDecoder::decode(mutation.changelist())?;
            match decoded.op {
                ChangeType::Delete => {
                    dst.selection.set_row_unselected(idx);
                }
                ChangeType::Reinsert => {
                    dst.selection.set_row_selected(idx);
                    let out = dst.row_mut(idx);
                    for (id, value) in &decoded.cols {
                        if let Some(out_idx) = deltas.output_index(*id) {
                            out[out_idx] = value.clone();
                        }
                    }
                }
                ChangeType::Update => {
                    let out = dst.row_mut(idx);
                    for (id, value) in &decoded.cols {
                        if let Some(out_idx) = deltas.output_index(*id) {
                            out[out_idx] = value.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
