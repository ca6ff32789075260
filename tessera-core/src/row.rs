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

//! Typed row values
//!
//! A [`Row`] is the write-path input: one [`Datum`] per schema column,
//! type-checked on construction. The storage layer packs rows into arena
//! memory; this module only defines the typed surface and the self-describing
//! cell codec used by change lists.

use std::fmt;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TesseraError};
use crate::schema::{ColumnType, Schema};

/// One typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Text(String),
    Binary(Vec<u8>),
}

/// Cell codec tags. Stable on the wire; change lists embed them.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_UINT64: u8 = 3;
const TAG_FLOAT64: u8 = 4;
const TAG_TEXT: u8 = 5;
const TAG_BINARY: u8 = 6;

impl Datum {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Whether this value is storable in a column of `ctype`.
    pub fn matches_type(&self, ctype: ColumnType) -> bool {
        match (self, ctype) {
            (Datum::Null, _) => true,
            (Datum::Bool(_), ColumnType::Bool) => true,
            (Datum::Int64(_), ColumnType::Int64) => true,
            (Datum::UInt64(_), ColumnType::UInt64) => true,
            (Datum::Float64(_), ColumnType::Float64) => true,
            (Datum::Text(_), ColumnType::Text) => true,
            (Datum::Binary(_), ColumnType::Binary) => true,
            _ => false,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Datum::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Appends `[tag][payload]` to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(TAG_NULL),
            Datum::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(*b as u8);
            }
            Datum::Int64(v) => {
                buf.push(TAG_INT64);
                buf.write_i64::<LittleEndian>(*v).expect("vec write");
            }
            Datum::UInt64(v) => {
                buf.push(TAG_UINT64);
                buf.write_u64::<LittleEndian>(*v).expect("vec write");
            }
            Datum::Float64(v) => {
                buf.push(TAG_FLOAT64);
                buf.write_f64::<LittleEndian>(*v).expect("vec write");
            }
            Datum::Text(s) => {
                buf.push(TAG_TEXT);
                buf.write_u32::<LittleEndian>(s.len() as u32).expect("vec write");
                buf.extend_from_slice(s.as_bytes());
            }
            Datum::Binary(b) => {
                buf.push(TAG_BINARY);
                buf.write_u32::<LittleEndian>(b.len() as u32).expect("vec write");
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decodes one cell from the front of `cursor`, advancing it.
    pub fn decode_from(cursor: &mut &[u8]) -> Result<Datum> {
        let tag = cursor
            .read_u8()
            .map_err(|_| TesseraError::Corruption("truncated cell tag".into()))?;
        let truncated = |what: &str| TesseraError::Corruption(format!("truncated {} cell", what));
        match tag {
            TAG_NULL => Ok(Datum::Null),
            TAG_BOOL => {
                let b = cursor.read_u8().map_err(|_| truncated("bool"))?;
                Ok(Datum::Bool(b != 0))
            }
            TAG_INT64 => Ok(Datum::Int64(
                cursor.read_i64::<LittleEndian>().map_err(|_| truncated("int64"))?,
            )),
            TAG_UINT64 => Ok(Datum::UInt64(
                cursor.read_u64::<LittleEndian>().map_err(|_| truncated("uint64"))?,
            )),
            TAG_FLOAT64 => Ok(Datum::Float64(
                cursor.read_f64::<LittleEndian>().map_err(|_| truncated("float64"))?,
            )),
            TAG_TEXT | TAG_BINARY => {
                let len = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated("var-len"))? as usize;
                if cursor.len() < len {
                    return Err(truncated("var-len"));
                }
                let remaining = *cursor;
                let (payload, rest) = remaining.split_at(len);
                *cursor = rest;
                if tag == TAG_TEXT {
                    let s = std::str::from_utf8(payload)
                        .map_err(|_| TesseraError::Corruption("text cell is not utf-8".into()))?;
                    Ok(Datum::Text(s.to_owned()))
                } else {
                    Ok(Datum::Binary(payload.to_vec()))
                }
            }
            other => Err(TesseraError::Corruption(format!(
                "unknown cell tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::UInt64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{:?}", s),
            Datum::Binary(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
        }
    }
}

/// A schema-checked row: one datum per column, key columns non-null.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    schema: Arc<Schema>,
    values: Vec<Datum>,
}

impl Row {
    pub fn new(schema: Arc<Schema>, values: Vec<Datum>) -> Result<Row> {
        if values.len() != schema.num_columns() {
            return Err(TesseraError::InvalidArgument(format!(
                "row has {} values for {} columns",
                values.len(),
                schema.num_columns()
            )));
        }
        for (idx, (col, value)) in schema.columns().iter().zip(values.iter()).enumerate() {
            if !value.matches_type(col.ctype()) {
                return Err(TesseraError::InvalidArgument(format!(
                    "column '{}' type mismatch: {:?} vs {:?}",
                    col.name(),
                    value,
                    col.ctype()
                )));
            }
            if value.is_null() && (idx < schema.num_key_columns() || !col.is_nullable()) {
                return Err(TesseraError::InvalidArgument(format!(
                    "column '{}' must not be null",
                    col.name()
                )));
            }
        }
        Ok(Row { schema, values })
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    #[inline]
    pub fn value(&self, idx: usize) -> &Datum {
        &self.values[idx]
    }

    /// The key-column prefix of this row.
    #[inline]
    pub fn key_values(&self) -> &[Datum] {
        &self.values[..self.schema.num_key_columns()]
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (col, value)) in self.schema.columns().iter().zip(self.values.iter()).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", col.name(), value)?;
        }
        write!(f, ")")
    }
}
