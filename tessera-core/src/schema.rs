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

//! Table schemas: typed columns with stable ids and a primary-key prefix
//!
//! Columns are addressed two ways: by *position* within one schema, and by
//! *column id* across schemas. Ids survive projection, so a scan projection
//! and a change list both resolve against the base schema through ids rather
//! than positions.

use std::fmt;

use crate::error::{Result, TesseraError};

/// Stable column identifier assigned by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub u32);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int64,
    UInt64,
    Float64,
    Text,
    Binary,
}

impl ColumnType {
    /// Variable-length types store their payload out of line.
    #[inline]
    pub fn is_var_len(&self) -> bool {
        matches!(self, ColumnType::Text | ColumnType::Binary)
    }
}

/// One column of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    id: Option<ColumnId>,
    name: String,
    ctype: ColumnType,
    nullable: bool,
}

impl Column {
    /// A column with no id assigned yet. Schemas built from such columns
    /// cannot back a write buffer; see [`Schema::has_column_ids`].
    pub fn new(name: impl Into<String>, ctype: ColumnType, nullable: bool) -> Self {
        Self {
            id: None,
            name: name.into(),
            ctype,
            nullable,
        }
    }

    pub fn with_id(id: ColumnId, name: impl Into<String>, ctype: ColumnType, nullable: bool) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
            ctype,
            nullable,
        }
    }

    #[inline]
    pub fn id(&self) -> Option<ColumnId> {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn ctype(&self) -> ColumnType {
        self.ctype
    }

    #[inline]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }
}

/// An ordered set of columns whose first `num_key_columns` form the
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
    num_key_columns: usize,
}

impl Schema {
    pub fn new(columns: Vec<Column>, num_key_columns: usize) -> Result<Self> {
        if columns.is_empty() {
            return Err(TesseraError::InvalidArgument("schema has no columns".into()));
        }
        if num_key_columns == 0 || num_key_columns > columns.len() {
            return Err(TesseraError::InvalidArgument(format!(
                "invalid key column count {} for {} columns",
                num_key_columns,
                columns.len()
            )));
        }
        for col in &columns[..num_key_columns] {
            if col.nullable {
                return Err(TesseraError::InvalidArgument(format!(
                    "key column '{}' must not be nullable",
                    col.name
                )));
            }
        }
        let mut ids: Vec<ColumnId> = columns.iter().filter_map(|c| c.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != columns.iter().filter(|c| c.id.is_some()).count() {
            return Err(TesseraError::InvalidArgument("duplicate column id".into()));
        }
        Ok(Self {
            columns,
            num_key_columns,
        })
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[inline]
    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    /// True iff every column carries a catalog-assigned id. The write buffer
    /// requires this because mutations address columns by id.
    pub fn has_column_ids(&self) -> bool {
        self.columns.iter().all(|c| c.id.is_some())
    }

    /// Position of the column carrying `id`, if any.
    pub fn find_column_by_id(&self, id: ColumnId) -> Option<usize> {
        self.columns.iter().position(|c| c.id == Some(id))
    }

    pub fn find_column_by_name(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Schema over just the key columns.
    pub fn key_projection(&self) -> Schema {
        Schema {
            columns: self.columns[..self.num_key_columns].to_vec(),
            num_key_columns: self.num_key_columns,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {:?}", col.name, col.ctype)?;
            if i < self.num_key_columns {
                write!(f, " KEY")?;
            }
        }
        write!(f, ")")
    }
}

/// Maps the columns of an output schema onto positions in a base schema,
/// resolved by column id.
#[derive(Debug, Clone)]
pub struct Projection {
    /// `mapping[out_idx]` is the base-schema position of output column
    /// `out_idx`.
    mapping: Vec<usize>,
}

impl Projection {
    pub fn build(base: &Schema, output: &Schema) -> Result<Projection> {
        let mut mapping = Vec::with_capacity(output.num_columns());
        for col in output.columns() {
            let id = col.id().ok_or_else(|| {
                TesseraError::InvalidArgument(format!(
                    "projection column '{}' has no column id",
                    col.name()
                ))
            })?;
            let base_idx = base.find_column_by_id(id).ok_or_else(|| {
                TesseraError::InvalidArgument(format!(
                    "projection column '{}' (id {}) not present in base schema",
                    col.name(),
                    id
                ))
            })?;
            if base.column(base_idx).ctype() != col.ctype() {
                return Err(TesseraError::InvalidArgument(format!(
                    "projection column '{}' type mismatch",
                    col.name()
                )));
            }
            mapping.push(base_idx);
        }
        Ok(Projection { mapping })
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.mapping.len()
    }

    /// Base-schema position for output column `out_idx`.
    #[inline]
    pub fn base_index(&self, out_idx: usize) -> usize {
        self.mapping[out_idx]
    }
}

/// Maps change-list column ids onto positions in an output schema. Ids not
/// present in the output are simply not projected.
#[derive(Debug, Clone)]
pub struct DeltaProjection {
    ids: Vec<(ColumnId, usize)>,
}

impl DeltaProjection {
    pub fn build(output: &Schema) -> Result<DeltaProjection> {
        let mut ids = Vec::with_capacity(output.num_columns());
        for (idx, col) in output.columns().iter().enumerate() {
            let id = col.id().ok_or_else(|| {
                TesseraError::InvalidArgument(format!(
                    "projection column '{}' has no column id",
                    col.name()
                ))
            })?;
            ids.push((id, idx));
        }
        ids.sort_unstable_by_key(|(id, _)| *id);
        Ok(DeltaProjection { ids })
    }

    /// Output position for the column carrying `id`, if projected.
    #[inline]
    pub fn output_index(&self, id: ColumnId) -> Option<usize> {
        self.ids
            .binary_search_by_key(&id, |(id, _)| *id)
            .ok()
            .map(|i| self.ids[i].1)
    }
}
