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

//! Randomized cache workloads checked against a per-shard reference model.
//!
//! The model mirrors the sharding function (64-bit xxhash, top 4 bits) and
//! replays insert/lookup/erase sequences on plain vectors. After every
//! operation the real cache must agree on hits, misses, and total usage;
//! at the end every deleter must have run exactly once.

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use twox_hash::XxHash64;

use tessera_storage::cache::{CacheDeleter, ShardedLruCache, NUM_CACHE_SHARDS};

const PER_SHARD_CAPACITY: usize = 16;
const TOTAL_CAPACITY: usize = NUM_CACHE_SHARDS * PER_SHARD_CAPACITY;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8, usize),
    Lookup(u8),
    Erase(u8),
}

/// Resident entry in the model: key, charge, and the id of its deleter.
#[derive(Debug, Clone)]
struct ModelEntry {
    key: Vec<u8>,
    charge: usize,
    deleter_id: usize,
}

/// One model shard: LRU-ordered residents (front = oldest) and usage.
#[derive(Debug, Default)]
struct ModelShard {
    residents: Vec<ModelEntry>,
    usage: usize,
}

fn shard_of(key: &[u8]) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    (hasher.finish() >> 60) as usize
}

fn key_bytes(idx: u8) -> Vec<u8> {
    format!("block-{}", idx).into_bytes()
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = 0u8..24;
    prop_oneof![
        (key.clone(), 1usize..6).prop_map(|(k, c)| Op::Insert(k, c)),
        key.clone().prop_map(Op::Lookup),
        key.prop_map(Op::Erase),
    ]
}

impl ModelShard {
    /// Mirrors shard insert: displace same key, append at MRU, evict from
    /// the LRU end while over capacity. Returns deleter ids freed.
    fn insert(&mut self, entry: ModelEntry) -> Vec<usize> {
        let mut freed = Vec::new();
        if let Some(pos) = self.residents.iter().position(|e| e.key == entry.key) {
            let old = self.residents.remove(pos);
            self.usage -= old.charge;
            freed.push(old.deleter_id);
        }
        self.usage += entry.charge;
        self.residents.push(entry);
        while self.usage > PER_SHARD_CAPACITY && !self.residents.is_empty() {
            let victim = self.residents.remove(0);
            self.usage -= victim.charge;
            freed.push(victim.deleter_id);
        }
        freed
    }

    fn lookup(&mut self, key: &[u8]) -> bool {
        match self.residents.iter().position(|e| e.key == key) {
            Some(pos) => {
                let entry = self.residents.remove(pos);
                self.residents.push(entry);
                true
            }
            None => false,
        }
    }

    fn erase(&mut self, key: &[u8]) -> Option<usize> {
        let pos = self.residents.iter().position(|e| e.key == key)?;
        let entry = self.residents.remove(pos);
        self.usage -= entry.charge;
        Some(entry.deleter_id)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn random_workload_matches_model(ops in prop::collection::vec(op_strategy(), 1..150)) {
        let cache = ShardedLruCache::new(TOTAL_CAPACITY);
        let mut shards: Vec<ModelShard> =
            (0..NUM_CACHE_SHARDS).map(|_| ModelShard::default()).collect();
        let mut deleters: Vec<Arc<AtomicUsize>> = Vec::new();
        // Entries freed by the model so far; checked incrementally.
        let mut freed: Vec<usize> = Vec::new();

        for op in &ops {
            match op {
                Op::Insert(k, charge) => {
                    let key = key_bytes(*k);
                    let counter = Arc::new(AtomicUsize::new(0));
                    let deleter_id = deleters.len();
                    deleters.push(counter.clone());
                    let deleter: CacheDeleter = Box::new(move |_key, _value| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    // Release immediately so the cache holds the only ref.
                    cache.release(cache.insert(&key, Box::new(*k), *charge, deleter));
                    let entry = ModelEntry { key: key.clone(), charge: *charge, deleter_id };
                    freed.extend(shards[shard_of(&key)].insert(entry));
                }
                Op::Lookup(k) => {
                    let key = key_bytes(*k);
                    let expected = shards[shard_of(&key)].lookup(&key);
                    match cache.lookup(&key) {
                        Some(handle) => {
                            prop_assert!(expected, "unexpected hit for {:?}", key);
                            prop_assert_eq!(handle.value_as::<u8>(), Some(&*k));
                            cache.release(handle);
                        }
                        None => prop_assert!(!expected, "unexpected miss for {:?}", key),
                    }
                }
                Op::Erase(k) => {
                    let key = key_bytes(*k);
                    cache.erase(&key);
                    freed.extend(shards[shard_of(&key)].erase(&key));
                }
            }

            let model_usage: usize = shards.iter().map(|s| s.usage).sum();
            prop_assert_eq!(cache.usage(), model_usage);
            prop_assert!(cache.usage() <= TOTAL_CAPACITY);
            prop_assert_eq!(cache.mem_tracker().consumption(), model_usage as i64);

            // Everything the model freed has had its deleter run, exactly
            // once; resident entries have not.
            for (id, counter) in deleters.iter().enumerate() {
                let expected = if freed.contains(&id) { 1 } else { 0 };
                prop_assert_eq!(counter.load(Ordering::SeqCst), expected, "deleter {}", id);
            }
        }

        // Tearing the cache down frees every remaining resident.
        drop(cache);
        for counter in &deleters {
            prop_assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }
}
