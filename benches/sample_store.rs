//! Probe bracket overhead and statistics cost using criterion.
//!
//! The probe bracket sits inside every measured kernel, so its own cost has
//! to stay negligible next to a coherence miss.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use linebench::samples::{AbsDeviation, SampleStore};

fn bench_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record", |b| {
        let mut store = SampleStore::new(1024);
        let mut rep = 0usize;
        b.iter(|| {
            store.record(0, rep & 1023, || std::hint::black_box(1u64));
            rep += 1;
        })
    });

    group.bench_function("summarize_10k", |b| {
        let samples: Vec<u64> = (0u64..10_000).map(|i| (i * 7919) % 1024).collect();
        b.iter(|| AbsDeviation::of(std::hint::black_box(&samples)))
    });

    group.finish();
}

criterion_group!(benches, bench_probe);
criterion_main!(benches);
