//! Benchmarks for OrionKV engine operations

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use orionkv::Engine;

fn engine_benchmarks(c: &mut Criterion) {
    c.bench_function("scalar set", |b| {
        let engine = Engine::new();
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key{}", i % 10_000);
            engine.set(black_box(key.as_bytes()), b"value", None);
            i += 1;
        });
    });

    c.bench_function("scalar get hit", |b| {
        let engine = Engine::new();
        for i in 0..10_000u64 {
            engine.set(format!("key{}", i).as_bytes(), b"value", None);
        }
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key{}", i % 10_000);
            black_box(engine.get(key.as_bytes()));
            i += 1;
        });
    });

    c.bench_function("zadd indexed mode", |b| {
        let engine = Engine::new();
        // pre-size past the migration threshold so the skiplist is measured
        for i in 0..1_000u64 {
            engine.zadd(b"z", i as f64, format!("m{}", i).as_bytes());
        }
        let mut i = 1_000u64;
        b.iter(|| {
            engine.zadd(b"z", i as f64, format!("m{}", i % 20_000).as_bytes());
            i += 1;
        });
    });

    c.bench_function("zrange 100 of 1k", |b| {
        let engine = Engine::new();
        for i in 0..1_000u64 {
            engine.zadd(b"z", i as f64, format!("m{}", i).as_bytes());
        }
        b.iter(|| {
            black_box(engine.lock().zrange(b"z", 450, 549));
        });
    });
}

criterion_group!(benches, engine_benchmarks);
criterion_main!(benches);
