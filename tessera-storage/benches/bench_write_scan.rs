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

//! Write-buffer and cache microbenchmarks
//!
//! Run with: `cargo bench -p tessera-storage --bench bench_write_scan`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tessera_core::{Column, ColumnId, ColumnType, Datum, OpId, Row, Schema};
use tessera_storage::anchor::AnchorRegistry;
use tessera_storage::cache::{CacheDeleter, ShardedLruCache};
use tessera_storage::iterator::RowBlock;
use tessera_storage::memrowset::{MemRowSet, MemRowSetOptions};
use tessera_storage::mvcc::MvccSnapshot;

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new(
            vec![
                Column::with_id(ColumnId(0), "pk", ColumnType::UInt64, false),
                Column::with_id(ColumnId(1), "v", ColumnType::Text, true),
            ],
            1,
        )
        .unwrap(),
    )
}

fn filled_mrs(schema: &Arc<Schema>, n: u64) -> Arc<MemRowSet> {
    let mrs = MemRowSet::new(
        1,
        schema.clone(),
        AnchorRegistry::new(),
        None,
        MemRowSetOptions::default(),
    )
    .unwrap();
    for pk in 0..n {
        let row = Row::new(
            schema.clone(),
            vec![Datum::UInt64(pk), Datum::Text(format!("value-{}", pk))],
        )
        .unwrap();
        mrs.insert(pk, &row, OpId::new(1, pk)).unwrap();
    }
    mrs
}

fn bench_mrs_insert(c: &mut Criterion) {
    let schema = schema();
    let mut group = c.benchmark_group("memrowset/insert");
    group.throughput(Throughput::Elements(1));
    group.bench_function("sequential", |b| {
        let mut pk = 0u64;
        let mut mrs = filled_mrs(&schema, 0);
        b.iter(|| {
            let row = Row::new(
                schema.clone(),
                vec![Datum::UInt64(pk), Datum::Text("value".into())],
            )
            .unwrap();
            mrs.insert(pk, &row, OpId::new(1, pk)).unwrap();
            pk += 1;
            // Bound the buffer so long runs don't grow without limit.
            if pk % 100_000 == 0 {
                mrs = filled_mrs(&schema, 0);
            }
        });
    });
    group.finish();
}

fn bench_mrs_scan(c: &mut Criterion) {
    let schema = schema();
    let mut group = c.benchmark_group("memrowset/scan");
    for size in [1_000u64, 10_000, 100_000] {
        let mrs = filled_mrs(&schema, size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut iter = mrs
                    .new_iterator(&schema, MvccSnapshot::all_committed())
                    .unwrap();
                iter.init(None).unwrap();
                let mut block = RowBlock::new(schema.clone(), 1024);
                let mut rows = 0usize;
                while iter.has_next() {
                    iter.next_block(&mut block).unwrap();
                    rows += block.nrows();
                }
                black_box(rows)
            });
        });
    }
    group.finish();
}

fn bench_cache_lookup(c: &mut Criterion) {
    let cache = ShardedLruCache::new(64 * 1024 * 1024);
    for i in 0..10_000u64 {
        let key = i.to_be_bytes();
        let deleter: CacheDeleter = Box::new(|_k, _v| {});
        cache.release(cache.insert(&key, Box::new(i), 4096, deleter));
    }

    let mut group = c.benchmark_group("cache/lookup");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % 10_000).to_be_bytes();
            i += 1;
            let handle = cache.lookup(&key);
            black_box(handle.is_some())
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_mrs_insert,
    bench_mrs_scan,
    bench_cache_lookup
);
criterion_main!(benches);
