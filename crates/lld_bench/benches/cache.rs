//! Cache benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lld_bench::generate_entries;
use lld_core::{LfuCache, LruCache, ValueCache};

fn caches(max_entries: usize) -> Vec<(&'static str, Box<dyn ValueCache>)> {
    vec![
        ("lru", Box::new(LruCache::with_entries(max_entries)) as Box<dyn ValueCache>),
        ("lfu", Box::new(LfuCache::with_entries(max_entries)) as Box<dyn ValueCache>),
    ]
}

/// Benchmark inserts that keep evicting.
fn bench_cache_put_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_put_evicting");
    let entries = generate_entries(4_096, 128);
    group.throughput(Throughput::Elements(entries.len() as u64));

    for (name, cache) in caches(256) {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                for (key, value) in &entries {
                    cache.put(black_box(key), black_box(value));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark hits on a warm cache.
fn bench_cache_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_hit");
    let entries = generate_entries(1_024, 128);
    group.throughput(Throughput::Elements(entries.len() as u64));

    for (name, cache) in caches(entries.len()) {
        for (key, value) in &entries {
            cache.put(key, value);
        }
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                for (key, _) in &entries {
                    black_box(cache.get(black_box(key)));
                }
            });
        });
    }

    group.finish();
}

/// Benchmark a skewed workload where a few keys take most reads.
fn bench_cache_skewed(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_skewed");
    let entries = generate_entries(2_048, 64);
    let hot = &entries[..64];

    for (name, cache) in caches(512) {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| {
                for (i, (key, value)) in entries.iter().enumerate() {
                    let (hot_key, hot_value) = &hot[i % hot.len()];
                    if cache.get(hot_key).is_none() {
                        cache.put(hot_key, hot_value);
                    }
                    if cache.get(key).is_none() {
                        cache.put(key, value);
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_put_evicting,
    bench_cache_get_hit,
    bench_cache_skewed
);
criterion_main!(benches);
