use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reqwest::Url;
use std::time::Duration;
use tempfile::TempDir;

use yt_cipher_rs::fetcher::derive_content_key;
use yt_cipher_rs::storage::{DiskCache, DiskCacheConfig, MemoryCache};

fn bench_memory_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_cache");

    for size in [100usize, 1000, 10_000] {
        let cache = MemoryCache::new(size, Duration::from_secs(3600));
        for i in 0..size {
            cache.set(format!("key-{}", i), i);
        }
        let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i % size)).collect();

        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(BenchmarkId::new("get_hit", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(cache.get(key));
                }
            });
        });
    }

    // Every insert past capacity evicts
    let cache = MemoryCache::new(1000, Duration::from_secs(3600));
    let mut counter = 0u64;
    group.throughput(Throughput::Elements(1));
    group.bench_function("set_with_eviction", |b| {
        b.iter(|| {
            counter += 1;
            cache.set(format!("key-{}", counter), counter);
        });
    });

    group.finish();
}

fn bench_content_key(c: &mut Criterion) {
    let player = Url::parse("https://www.youtube.com/s/player/abc123/player_ias.vflset/en_US/base.js").unwrap();

    c.bench_function("derive_content_key", |b| {
        b.iter(|| black_box(derive_content_key(black_box(&player))));
    });
}

fn bench_disk_cache(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::new(DiskCacheConfig {
        dir: dir.path().to_path_buf(),
        ..DiskCacheConfig::default()
    })
    .unwrap();

    let small = "x".repeat(16 * 1024);
    let large = "var a=1;".repeat(32 * 1024);
    runtime.block_on(async {
        cache.set("small", &small, None).await.unwrap();
        cache.set("large", &large, None).await.unwrap();
    });

    let mut group = c.benchmark_group("disk_cache");
    group.sample_size(20);
    for key in ["small", "large"] {
        group.bench_function(BenchmarkId::new("get", key), |b| {
            b.iter(|| black_box(runtime.block_on(cache.get(key))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_memory_cache, bench_content_key, bench_disk_cache);
criterion_main!(benches);
