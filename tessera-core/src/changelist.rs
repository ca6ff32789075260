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

//! Change-list codec
//!
//! A change list is the byte payload of one mutation in a row's redo chain:
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ op: u8     │ entries until end of buffer                  │
//! │            │   [col_id: u32 LE][cell: tagged Datum codec] │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! `DELETE` carries no entries. `REINSERT` carries every column of the new
//! row image. Decoding failures are reported as `Corruption`; replay paths
//! treat that as a violated invariant rather than a recoverable error.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TesseraError};
use crate::row::{Datum, Row};
use crate::schema::ColumnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeType {
    Update = 1,
    Delete = 2,
    Reinsert = 3,
}

impl ChangeType {
    fn from_byte(b: u8) -> Option<ChangeType> {
        match b {
            1 => Some(ChangeType::Update),
            2 => Some(ChangeType::Delete),
            3 => Some(ChangeType::Reinsert),
            _ => None,
        }
    }
}

/// Builds an encoded change list.
#[derive(Debug, Default)]
pub struct ChangeListEncoder {
    buf: Vec<u8>,
}

impl ChangeListEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an UPDATE; follow with [`ChangeListEncoder::add_column_update`].
    pub fn set_to_update(&mut self) {
        self.buf.clear();
        self.buf.push(ChangeType::Update as u8);
    }

    pub fn set_to_delete(&mut self) {
        self.buf.clear();
        self.buf.push(ChangeType::Delete as u8);
    }

    /// Encodes a REINSERT carrying the full new row image.
    pub fn set_to_reinsert(&mut self, row: &Row) -> Result<()> {
        self.buf.clear();
        self.buf.push(ChangeType::Reinsert as u8);
        for (col, value) in row.schema().columns().iter().zip(row.values()) {
            let id = col.id().ok_or_else(|| {
                TesseraError::InvalidArgument(format!("column '{}' has no column id", col.name()))
            })?;
            self.push_entry(id, value);
        }
        Ok(())
    }

    /// Adds one column delta to an UPDATE. `Datum::Null` sets the column
    /// to NULL.
    pub fn add_column_update(&mut self, id: ColumnId, value: &Datum) {
        debug_assert!(!self.buf.is_empty(), "set_to_update not called");
        self.push_entry(id, value);
    }

    fn push_entry(&mut self, id: ColumnId, value: &Datum) {
        self.buf.write_u32::<LittleEndian>(id.0).expect("vec write");
        value.encode_into(&mut self.buf);
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// A decoded change list: the opcode and per-column new values.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChangeList {
    pub op: ChangeType,
    pub cols: Vec<(ColumnId, Datum)>,
}

impl DecodedChangeList {
    #[inline]
    pub fn is_update(&self) -> bool {
        self.op == ChangeType::Update
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.op == ChangeType::Delete
    }

    #[inline]
    pub fn is_reinsert(&self) -> bool {
        self.op == ChangeType::Reinsert
    }
}

impl fmt::Display for DecodedChangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            ChangeType::Delete => write!(f, "DELETE"),
            ChangeType::Update | ChangeType::Reinsert => {
                write!(
                    f,
                    "{}(",
                    if self.is_update() { "UPDATE" } else { "REINSERT" }
                )?;
                for (i, (id, value)) in self.cols.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "col {}={}", id, value)?;
                }
                write!(f, ")")
            }
        }
    }
}

pub struct ChangeListDecoder;

impl ChangeListDecoder {
    pub fn decode(bytes: &[u8]) -> Result<DecodedChangeList> {
        let mut cursor = bytes;
        let op_byte = cursor
            .read_u8()
            .map_err(|_| TesseraError::Corruption("empty change list".into()))?;
        let op = ChangeType::from_byte(op_byte)
            .ok_or_else(|| TesseraError::Corruption(format!("unknown change op {}", op_byte)))?;

        if op == ChangeType::Delete {
            if !cursor.is_empty() {
                return Err(TesseraError::Corruption(
                    "DELETE change list carries a payload".into(),
                ));
            }
            return Ok(DecodedChangeList { op, cols: Vec::new() });
        }

        let mut cols = Vec::new();
        while !cursor.is_empty() {
            let id = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| TesseraError::Corruption("truncated column id".into()))?;
            let value = Datum::decode_from(&mut cursor)?;
            cols.push((ColumnId(id), value));
        }
        if cols.is_empty() {
            return Err(TesseraError::Corruption(format!(
                "{:?} change list carries no columns",
                op
            )));
        }
        Ok(DecodedChangeList { op, cols })
    }
}
