//! Write-path and search-path micro-benchmarks.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use pulsedb::{Config, EmbeddingDimension, NewExperience, PulseDb, SyncMode};
use tempfile::TempDir;

const DIM: usize = 384;

fn embedding(seed: u64) -> Vec<f32> {
    (0..DIM)
        .map(|i| ((seed as f32) * 0.7 + i as f32 * 0.013).sin())
        .collect()
}

fn config() -> Config {
    Config {
        embedding_dimension: EmbeddingDimension::Custom(DIM),
        // Benchmarks measure engine overhead, not fsync latency.
        sync_mode: SyncMode::Fast,
        ..Config::default()
    }
}

fn bench_record(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = PulseDb::open(dir.path().join("bench.db"), config()).unwrap();
    let coll = db.create_collective("bench").unwrap();

    let mut seed = 0u64;
    c.bench_function("record_experience", |b| {
        b.iter_batched(
            || {
                seed += 1;
                NewExperience {
                    collective_id: coll,
                    content: format!("benchmark experience {seed}"),
                    embedding: Some(embedding(seed)),
                    ..Default::default()
                }
            },
            |new| db.record_experience(new).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_search(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = PulseDb::open(dir.path().join("bench.db"), config()).unwrap();
    let coll = db.create_collective("bench").unwrap();

    for seed in 0..10_000u64 {
        db.record_experience(NewExperience {
            collective_id: coll,
            content: format!("corpus entry {seed}"),
            embedding: Some(embedding(seed)),
            ..Default::default()
        })
        .unwrap();
    }

    let query = embedding(4_242);
    c.bench_function("search_similar_k10_10k", |b| {
        b.iter(|| db.search_similar(coll, &query, 10).unwrap())
    });

    c.bench_function("get_recent_50_10k", |b| {
        b.iter(|| db.get_recent_experiences(coll, 50).unwrap())
    });
}

criterion_group!(benches, bench_record, bench_search);
criterion_main!(benches);
