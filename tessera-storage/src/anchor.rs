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

//! Op-id anchoring
//!
//! Each write buffer anchors the earliest replication op id it has applied.
//! The log retention policy queries the registry's minimum and must not
//! truncate past it until the owning buffer flushes and releases its anchor.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use tessera_core::OpId;

/// Registry of anchored op ids, keyed by owner name.
#[derive(Debug, Default)]
pub struct AnchorRegistry {
    anchors: DashMap<String, OpId>,
}

impl AnchorRegistry {
    pub fn new() -> Arc<AnchorRegistry> {
        Arc::new(AnchorRegistry::default())
    }

    fn set(&self, owner: &str, op_id: OpId) {
        self.anchors.insert(owner.to_owned(), op_id);
    }

    fn remove(&self, owner: &str) {
        self.anchors.remove(owner);
    }

    /// The earliest anchored op id across all owners, if any.
    pub fn min_anchored(&self) -> Option<OpId> {
        self.anchors.iter().map(|e| *e.value()).min()
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }
}

/// Tracks the minimum op id observed by one owner and keeps the registry in
/// sync with it.
#[derive(Debug)]
pub struct MinOpIdAnchorer {
    registry: Arc<AnchorRegistry>,
    owner: String,
    anchored: Mutex<Option<OpId>>,
}

impl MinOpIdAnchorer {
    pub fn new(registry: Arc<AnchorRegistry>, owner: impl Into<String>) -> Self {
        Self {
            registry,
            owner: owner.into(),
            anchored: Mutex::new(None),
        }
    }

    /// Anchors `op_id` if it is earlier than anything anchored so far.
    pub fn anchor_if_minimum(&self, op_id: OpId) {
        let mut anchored = self.anchored.lock();
        match *anchored {
            Some(current) if current <= op_id => {}
            _ => {
                *anchored = Some(op_id);
                self.registry.set(&self.owner, op_id);
            }
        }
    }

    /// Releases the anchor, if any. Idempotent; called once the owner's
    /// contents are durably flushed.
    pub fn release(&self) {
        let mut anchored = self.anchored.lock();
        if anchored.take().is_some() {
            self.registry.remove(&self.owner);
        }
    }

    pub fn anchored(&self) -> Option<OpId> {
        *self.anchored.lock()
    }
}

impl Drop for MinOpIdAnchorer {
    fn drop(&mut self) {
        self.release();
    }
}
