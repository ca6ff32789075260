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

//! Comparable key encoding
//!
//! Encodes a row's key columns into a byte string whose lexicographic order
//! equals the schema's key order, so the ordered container can compare raw
//! bytes without decoding:
//!
//! - `UInt64`: big-endian
//! - `Int64`: sign bit flipped, big-endian
//! - `Float64`: IEEE total-order transform, big-endian
//! - `Bool`: one byte
//! - `Text` / `Binary`: `0x00` escaped as `0x00 0x01`; non-terminal key
//!   columns append a `0x00 0x00` separator so `("a", "b")` never collides
//!   with `("ab", "")`

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use smallvec::SmallVec;

use crate::error::{Result, TesseraError};
use crate::row::{Datum, Row};
use crate::schema::Schema;

/// Scratch buffer sized so typical composite keys stay on the stack.
pub type KeyBuf = SmallVec<[u8; 64]>;

/// Encodes the key prefix of `row` into `buf` (cleared first).
pub fn encode_comparable_key(row: &Row, buf: &mut KeyBuf) -> Result<()> {
    encode_key_cells(row.schema(), row.key_values(), buf)
}

/// Encodes `cells` as the leading key columns of `schema`. Accepts a strict
/// prefix of the key columns, which is how scan bounds seek.
pub fn encode_key_cells(schema: &Schema, cells: &[Datum], buf: &mut KeyBuf) -> Result<()> {
    if cells.is_empty() || cells.len() > schema.num_key_columns() {
        return Err(TesseraError::InvalidArgument(format!(
            "{} key cells for {} key columns",
            cells.len(),
            schema.num_key_columns()
        )));
    }
    buf.clear();
    for (idx, cell) in cells.iter().enumerate() {
        let col = schema.column(idx);
        if !cell.matches_type(col.ctype()) {
            return Err(TesseraError::InvalidArgument(format!(
                "key column '{}' type mismatch",
                col.name()
            )));
        }
        let is_last = idx + 1 == schema.num_key_columns();
        encode_cell(cell, is_last, buf)?;
    }
    Ok(())
}

fn encode_cell(cell: &Datum, is_last: bool, buf: &mut KeyBuf) -> Result<()> {
    match cell {
        Datum::UInt64(v) => buf.write_u64::<BigEndian>(*v).expect("buf write"),
        Datum::Int64(v) => buf
            .write_u64::<BigEndian>((*v as u64) ^ (1u64 << 63))
            .expect("buf write"),
        Datum::Float64(v) => {
            // IEEE-754 total order: non-negative values flip the sign bit,
            // negative values flip every bit.
            let bits = v.to_bits();
            let ordered = if bits >> 63 == 0 { bits ^ (1u64 << 63) } else { !bits };
            buf.write_u64::<BigEndian>(ordered).expect("buf write");
        }
        Datum::Bool(b) => buf.push(*b as u8),
        Datum::Text(s) => encode_escaped(s.as_bytes(), is_last, buf),
        Datum::Binary(b) => encode_escaped(b, is_last, buf),
        Datum::Null => {
            return Err(TesseraError::InvalidArgument(
                "key columns must not be null".into(),
            ))
        }
    }
    Ok(())
}

fn encode_escaped(data: &[u8], is_last: bool, buf: &mut KeyBuf) {
    for &b in data {
        if b == 0x00 {
            buf.write_all(&[0x00, 0x01]).expect("buf write");
        } else {
            buf.push(b);
        }
    }
    if !is_last {
        buf.write_all(&[0x00, 0x00]).expect("buf write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnId, ColumnType};
    use std::sync::Arc;

    fn encode(schema: &Arc<Schema>, values: Vec<Datum>) -> Vec<u8> {
        let row = Row::new(schema.clone(), values).unwrap();
        let mut buf = KeyBuf::new();
        encode_comparable_key(&row, &mut buf).unwrap();
        buf.to_vec()
    }

    fn u64_schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                vec![Column::with_id(ColumnId(0), "pk", ColumnType::UInt64, false)],
                1,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_uint_order() {
        let schema = u64_schema();
        let a = encode(&schema, vec![Datum::UInt64(1)]);
        let b = encode(&schema, vec![Datum::UInt64(2)]);
        let c = encode(&schema, vec![Datum::UInt64(1 << 40)]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_int_order_across_sign() {
        let schema = Arc::new(
            Schema::new(
                vec![Column::with_id(ColumnId(0), "pk", ColumnType::Int64, false)],
                1,
            )
            .unwrap(),
        );
        let neg = encode(&schema, vec![Datum::Int64(-5)]);
        let zero = encode(&schema, vec![Datum::Int64(0)]);
        let pos = encode(&schema, vec![Datum::Int64(5)]);
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn test_float_order() {
        let schema = Arc::new(
            Schema::new(
                vec![Column::with_id(ColumnId(0), "pk", ColumnType::Float64, false)],
                1,
            )
            .unwrap(),
        );
        let values = [-10.5f64, -0.0, 0.0, 0.25, 1e10];
        let mut prev: Option<Vec<u8>> = None;
        for v in values {
            let enc = encode(&schema, vec![Datum::Float64(v)]);
            if let Some(p) = prev {
                assert!(p <= enc, "order violated at {}", v);
            }
            prev = Some(enc);
        }
    }

    #[test]
    fn test_composite_string_disambiguation() {
        let schema = Arc::new(
            Schema::new(
                vec![
                    Column::with_id(ColumnId(0), "a", ColumnType::Text, false),
                    Column::with_id(ColumnId(1), "b", ColumnType::Text, false),
                    Column::with_id(ColumnId(2), "v", ColumnType::Int64, true),
                ],
                2,
            )
            .unwrap(),
        );
        let ab_empty = encode(
            &schema,
            vec![Datum::Text("ab".into()), Datum::Text("".into()), Datum::Null],
        );
        let a_b = encode(
            &schema,
            vec![Datum::Text("a".into()), Datum::Text("b".into()), Datum::Null],
        );
        assert_ne!(ab_empty, a_b);
        // "a" sorts before "ab" regardless of the second column.
        assert!(a_b < ab_empty);
    }

    #[test]
    fn test_embedded_zero_escaping() {
        let schema = Arc::new(
            Schema::new(
                vec![
                    Column::with_id(ColumnId(0), "a", ColumnType::Binary, false),
                    Column::with_id(ColumnId(1), "b", ColumnType::Binary, false),
                ],
                2,
            )
            .unwrap(),
        );
        let with_zero = encode(
            &schema,
            vec![Datum::Binary(vec![1, 0, 2]), Datum::Binary(vec![])],
        );
        let without = encode(
            &schema,
            vec![Datum::Binary(vec![1]), Datum::Binary(vec![2])],
        );
        assert_ne!(with_zero, without);
    }

    #[test]
    fn test_key_prefix_seek_encoding() {
        let schema = Arc::new(
            Schema::new(
                vec![
                    Column::with_id(ColumnId(0), "a", ColumnType::UInt64, false),
                    Column::with_id(ColumnId(1), "b", ColumnType::UInt64, false),
                ],
                2,
            )
            .unwrap(),
        );
        let mut prefix = KeyBuf::new();
        encode_key_cells(&schema, &[Datum::UInt64(3)], &mut prefix).unwrap();
        let mut full = KeyBuf::new();
        encode_key_cells(&schema, &[Datum::UInt64(3), Datum::UInt64(9)], &mut full).unwrap();
        assert!(full.as_slice() > prefix.as_slice());
        assert!(full.starts_with(&prefix));
    }

    #[test]
    fn test_rejects_null_key_cell() {
        let schema = u64_schema();
        let mut buf = KeyBuf::new();
        assert!(encode_key_cells(&schema, &[Datum::Null], &mut buf).is_err());
    }
}
