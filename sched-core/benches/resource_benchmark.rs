//! Benchmarks for `ResourceManager`'s hot path: `reserve`/`release`
//! under contention, and the exclusive-interest check added on top.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use sched_core::resource::{ResourceKind, ResourceManager};

fn reserve_release_roundtrip(c: &mut Criterion) {
    c.bench_function("reserve_release_single_kind", |b| {
        let mut mgr = ResourceManager::new(64, 64, 64, None);
        b.iter(|| {
            black_box(mgr.reserve(&[ResourceKind::Process], &[]));
            mgr.release(&[ResourceKind::Process]);
        })
    });
}

fn reserve_release_multi_kind(c: &mut Criterion) {
    c.bench_function("reserve_release_all_kinds", |b| {
        let mut mgr = ResourceManager::new(64, 64, 64, None);
        let kinds = [
            ResourceKind::Cache,
            ResourceKind::Download,
            ResourceKind::Upload,
            ResourceKind::Process,
        ];
        b.iter(|| {
            black_box(mgr.reserve(&kinds, &[]));
            mgr.release(&kinds);
        })
    });
}

fn reserve_under_exclusive_interest(c: &mut Criterion) {
    c.bench_function("reserve_denied_by_exclusive_interest", |b| {
        let mut mgr = ResourceManager::new(64, 64, 64, None);
        mgr.register_exclusive_interest(&[ResourceKind::Cache], "bench-cleanup");
        b.iter(|| {
            black_box(mgr.reserve(&[ResourceKind::Cache], &[]));
        })
    });
}

criterion_group!(
    benches,
    reserve_release_roundtrip,
    reserve_release_multi_kind,
    reserve_under_exclusive_interest
);
criterion_main!(benches);
