//! Shared test scaffolding.
#![allow(dead_code)] // each test binary uses its own subset of helpers

use pulsedb::{Config, EmbeddingDimension, NewExperience, PulseDb};
use tempfile::TempDir;

/// Dimension used across the integration suites. Small keeps index
/// construction fast without changing any code path.
pub const DIM: usize = 16;

/// A config with the test dimension.
pub fn test_config() -> Config {
    Config {
        embedding_dimension: EmbeddingDimension::Custom(DIM),
        ..Config::default()
    }
}

/// Opens a fresh database in a temp dir. Keep the `TempDir` alive for the
/// duration of the test.
pub fn open_db() -> (TempDir, PulseDb) {
    let dir = TempDir::new().unwrap();
    let db = PulseDb::open(dir.path().join("pulse.db"), test_config()).unwrap();
    (dir, db)
}

/// Deterministic embedding derived from text: same text, same vector.
pub fn embed(text: &str) -> Vec<f32> {
    embed_dim(text, DIM)
}

/// Deterministic embedding with an explicit dimension.
pub fn embed_dim(text: &str, dim: usize) -> Vec<f32> {
    let mut state: u64 = text
        .bytes()
        .fold(0xcbf29ce484222325, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
    let mut v = Vec::with_capacity(dim);
    for _ in 0..dim {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        v.push(((state >> 33) as f32 / (1u64 << 30) as f32) - 1.0);
    }
    v
}

/// A minimal valid experience for the given collective and content.
pub fn new_experience(collective: pulsedb::CollectiveId, content: &str) -> NewExperience {
    NewExperience {
        collective_id: collective,
        content: content.to_string(),
        embedding: Some(embed(content)),
        ..Default::default()
    }
}
