use std::collections::HashMap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use extendiblemap::ExtendibleHashMap;
use tempfile::tempdir;

/// Deterministic scrambled pairs so runs compare like with like.
fn generate_pairs(size: usize) -> Vec<(i32, i32)> {
    (0..size as u32)
        .map(|i| {
            // odd multiplier keeps the keys distinct; only 0 maps to 0
            let key = i.wrapping_mul(0x9E37_79B9).max(1) as i32;
            (key, i as i32 + 1)
        })
        .collect()
}

fn benchmark_hash_map_comparisons(c: &mut Criterion) {
    for &size in &[100_000, 1_000_000] {
        let mut group = c.benchmark_group(format!("size={size}"));
        if size >= 1_000_000 {
            // Reduce sample count for large benchmarks
            group.sample_size(10);
            group.measurement_time(Duration::from_secs(30));
        }

        let data = generate_pairs(size);

        group.bench_function("ExtendibleHashMap - put", |b| {
            b.iter_with_setup(
                || {
                    // Fresh file for each iteration
                    let dir = tempdir().unwrap();
                    let map = ExtendibleHashMap::open(dir.path().join("bench.map")).unwrap();
                    (dir, map)
                },
                |(_dir, map)| {
                    for &(k, v) in data.iter() {
                        map.put(black_box(k), black_box(v)).unwrap();
                    }
                },
            );
        });

        // Setup for the lookup benchmark
        let dir = tempdir().unwrap();
        let lookup_map = ExtendibleHashMap::open(dir.path().join("bench.map")).unwrap();
        for &(k, v) in data.iter() {
            lookup_map.put(k, v).unwrap();
        }
        group.bench_function("ExtendibleHashMap - has", |b| {
            b.iter(|| {
                for &(k, v) in data.iter() {
                    black_box(lookup_map.has(black_box(k), v).unwrap());
                }
            })
        });

        // --- std HashMap<i32, Vec<i32>> as the in-memory baseline ---
        group.bench_function("std HashMap - insert", |b| {
            b.iter(|| {
                let mut map: HashMap<i32, Vec<i32>> = HashMap::new();
                for &(k, v) in data.iter() {
                    map.entry(black_box(k)).or_default().push(black_box(v));
                }
                map
            })
        });

        let mut std_map: HashMap<i32, Vec<i32>> = HashMap::new();
        for &(k, v) in data.iter() {
            std_map.entry(k).or_default().push(v);
        }
        group.bench_function("std HashMap - get", |b| {
            b.iter(|| {
                for &(k, v) in data.iter() {
                    black_box(std_map.get(black_box(&k)).is_some_and(|vs| vs.contains(&v)));
                }
            })
        });
    }
}

criterion_group!(benches, benchmark_hash_map_comparisons);
criterion_main!(benches);
