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

//! Tessera Core
//!
//! Fundamental types shared by the tablet write and read paths:
//!
//! - **Schema**: typed columns with stable column ids and a key prefix
//! - **Rows**: typed cell values checked against a schema
//! - **Comparable keys**: order-preserving byte encoding of primary keys
//! - **Change lists**: the UPDATE / DELETE / REINSERT mutation codec
//! - **Op ids**: `(term, index)` identifiers from the replication layer

pub mod changelist;
pub mod error;
pub mod key;
pub mod opid;
pub mod row;
pub mod schema;

pub use changelist::{ChangeListDecoder, ChangeListEncoder, ChangeType, DecodedChangeList};
pub use error::{Result, TesseraError};
pub use key::encode_comparable_key;
pub use opid::OpId;
pub use row::{Datum, Row};
pub use schema::{Column, ColumnId, ColumnType, DeltaProjection, Projection, Schema};
