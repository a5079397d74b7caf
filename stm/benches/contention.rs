// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transaction throughput benchmarks
//!
//! Measures the fixed costs of the runtime: read-only regions, single-cell
//! updates, and a small multi-cell update, all on the ownership-record
//! method.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tmkit_stm::{Algorithm, Runtime, TCell};

fn bnc_read_only(c: &mut Criterion) {
    Runtime::select(Algorithm::MlLazy).ok();
    let cell = Arc::new(TCell::new(42u64));

    c.bench_function("read_only_region", |b| {
        b.iter(|| {
            let v = Runtime::atomic(|tx| cell.read(tx));
            criterion::black_box(v);
        })
    });
}

fn bnc_single_update(c: &mut Criterion) {
    Runtime::select(Algorithm::MlLazy).ok();
    let counter = Arc::new(TCell::new(0usize));

    c.bench_function("single_cell_update", |b| {
        b.iter(|| {
            Runtime::atomic(|tx| {
                let v = counter.read(tx)?;
                counter.write(tx, v + 1)
            });
        })
    });
}

fn bnc_multi_update(c: &mut Criterion) {
    Runtime::select(Algorithm::MlLazy).ok();
    let cells: Arc<Vec<TCell<u64>>> = Arc::new((0..8).map(|_| TCell::new(0)).collect());

    c.bench_function("eight_cell_update", |b| {
        b.iter(|| {
            Runtime::atomic(|tx| {
                for cell in cells.iter() {
                    let v = cell.read(tx)?;
                    cell.write(tx, v + 1)?;
                }
                Ok(())
            });
        })
    });
}

criterion_group!(benches, bnc_read_only, bnc_single_update, bnc_multi_update);
criterion_main!(benches);
