//! Database configuration.
//!
//! [`Config`] is validated once at [`PulseDb::open()`](crate::PulseDb::open).
//! Some settings (embedding dimension) are frozen into each collective at
//! creation time and only act as defaults afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Largest supported custom embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Database configuration options.
///
/// All fields have workable defaults; override with struct update syntax:
///
/// ```rust
/// use pulsedb::{Config, SyncMode};
///
/// let config = Config {
///     sync_mode: SyncMode::Fast,
///     ..Config::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// How embeddings are produced.
    pub embedding_provider: EmbeddingProvider,

    /// Default embedding dimension for newly created collectives.
    pub embedding_dimension: EmbeddingDimension,

    /// Accept existing collectives whose frozen dimension differs from
    /// `embedding_dimension` instead of refusing to open.
    pub infer_per_collective: bool,

    /// Page cache size handed to the storage engine, in bytes.
    pub cache_size_bytes: usize,

    /// Durability mode for committed writes.
    pub sync_mode: SyncMode,

    /// Vector index tuning parameters.
    pub hnsw: HnswConfig,

    /// Watch fan-out settings.
    pub watch: WatchConfig,

    /// Resource quotas.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // External is the safe default: no model runtime required.
            embedding_provider: EmbeddingProvider::External,
            // 384 matches all-MiniLM-L6-v2.
            embedding_dimension: EmbeddingDimension::D384,
            infer_per_collective: false,
            cache_size_bytes: 64 * 1024 * 1024,
            sync_mode: SyncMode::Normal,
            hnsw: HnswConfig::default(),
            watch: WatchConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// A configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for callers that supply their own embeddings.
    pub fn with_external_embeddings(dimension: EmbeddingDimension) -> Self {
        Self {
            embedding_provider: EmbeddingProvider::External,
            embedding_dimension: dimension,
            ..Default::default()
        }
    }

    /// Validates the configuration. Called by `PulseDb::open()`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache_size_bytes == 0 {
            return Err(ValidationError::invalid_field(
                "cache_size_bytes",
                "must be greater than 0",
            ));
        }
        if let EmbeddingDimension::Custom(dim) = self.embedding_dimension {
            if dim == 0 {
                return Err(ValidationError::invalid_field(
                    "embedding_dimension",
                    "custom dimension must be greater than 0",
                ));
            }
            if dim > MAX_DIMENSION {
                return Err(ValidationError::invalid_field(
                    "embedding_dimension",
                    format!("custom dimension must not exceed {MAX_DIMENSION}"),
                ));
            }
        }
        self.hnsw.validate()?;
        if self.watch.buffer_size == 0 {
            return Err(ValidationError::invalid_field(
                "watch.buffer_size",
                "must be greater than 0",
            ));
        }
        if self.limits.max_read_txns == 0 {
            return Err(ValidationError::invalid_field(
                "limits.max_read_txns",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// The default embedding dimension as a plain number.
    pub fn dimension(&self) -> usize {
        self.embedding_dimension.size()
    }
}

/// How embedding vectors are produced for new experiences and insights.
#[derive(Clone, Debug)]
pub enum EmbeddingProvider {
    /// The engine generates embeddings from content using a bundled model.
    ///
    /// Model execution is an external collaborator; opening with `Builtin`
    /// fails unless a runtime has been wired in through the
    /// [`EmbeddingService`](crate::embedding::EmbeddingService) seam.
    Builtin {
        /// Optional model path overriding the bundled default.
        model_path: Option<PathBuf>,
    },

    /// The caller supplies a pre-computed embedding with every write; the
    /// engine only validates its length.
    External,
}

impl EmbeddingProvider {
    /// True for the builtin provider.
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Builtin { .. })
    }

    /// True for the external provider.
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External)
    }
}

/// Embedding vector dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingDimension {
    /// 384 dimensions (all-MiniLM-L6-v2).
    #[default]
    D384,
    /// 768 dimensions (bge-base, BERT-base).
    D768,
    /// Any other dimension, 1..=4096.
    Custom(usize),
}

impl EmbeddingDimension {
    /// The dimension as a plain number.
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::D384 => 384,
            Self::D768 => 768,
            Self::Custom(n) => *n,
        }
    }
}

/// Durability mode for committed writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync on commit. After a crash the database reflects exactly the
    /// committed set.
    #[default]
    Normal,
    /// No fsync on commit; a crash may lose the most recent commits but
    /// always leaves a committed prefix.
    Fast,
    /// fsync plus two-phase commit of the database header.
    Paranoid,
}

impl SyncMode {
    /// True if every commit is flushed before returning.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Fast)
    }
}

/// Distance metric for vector search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Cosine distance over normalized vectors (default). Similarity
    /// reported as `1 - distance`.
    #[default]
    Cosine,
    /// Squared Euclidean distance. Similarity reported as `-distance`.
    L2,
}

/// Vector index tuning parameters.
///
/// Defaults target the 10K-100K experiences-per-collective range. Use
/// [`HnswConfig::for_scale`] to pick the tier matching an expected size.
///
/// | Collective size | M | ef_construction | ef_search |
/// |---|---|---|---|
/// | ≤ 10 K | 16 | 100 | 50 |
/// | 10 K – 100 K | 16 | 200 | 100 |
/// | 100 K – 1 M | 24 | 200 | 150 |
/// | > 1 M | 32 | 400 | 200 |
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Distance metric.
    pub metric: Metric,

    /// Connections established per node during construction.
    pub m: usize,

    /// Maximum connections kept at layer 0 (usually `2 * m`).
    pub m_max0: usize,

    /// Maximum connections kept at layers above 0 (usually `m`).
    pub m_max: usize,

    /// Beam width while building the graph.
    pub ef_construction: usize,

    /// Default beam width while searching; raised to `k` when `k` exceeds it.
    pub ef_search: usize,

    /// Layer draw factor, `1 / ln(m)`.
    pub ml: f64,

    /// Persist the index sidecar every this many commits (0 = only on close).
    pub persist_interval: u64,

    /// Rebuild the graph at the next save point once
    /// `tombstones / total > rebuild_tombstone_ratio`.
    pub rebuild_tombstone_ratio: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self::with_params(16, 200, 100)
    }
}

impl HnswConfig {
    fn with_params(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            metric: Metric::Cosine,
            m,
            m_max0: 2 * m,
            m_max: m,
            ef_construction,
            ef_search,
            ml: 1.0 / (m as f64).ln(),
            persist_interval: 512,
            rebuild_tombstone_ratio: 0.3,
        }
    }

    /// Parameters tiered by the expected number of vectors per collective.
    pub fn for_scale(expected_vectors: usize) -> Self {
        match expected_vectors {
            0..=10_000 => Self::with_params(16, 100, 50),
            10_001..=100_000 => Self::with_params(16, 200, 100),
            100_001..=1_000_000 => Self::with_params(24, 200, 150),
            _ => Self::with_params(32, 400, 200),
        }
    }

    /// Override the search beam width.
    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef;
        self
    }

    /// Override the distance metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.m == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.m",
                "must be greater than 0",
            ));
        }
        if self.ef_construction == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_construction",
                "must be greater than 0",
            ));
        }
        if self.ef_search == 0 {
            return Err(ValidationError::invalid_field(
                "hnsw.ef_search",
                "must be greater than 0",
            ));
        }
        if !(0.0..1.0).contains(&self.rebuild_tombstone_ratio) {
            return Err(ValidationError::invalid_field(
                "hnsw.rebuild_tombstone_ratio",
                "must be in [0.0, 1.0)",
            ));
        }
        Ok(())
    }
}

/// Watch fan-out settings.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Enable in-process subscriptions.
    pub in_process: bool,

    /// Suggested interval for [`poll_changes`](crate::PulseDb::poll_changes)
    /// callers, in milliseconds.
    pub poll_interval_ms: u64,

    /// Bounded per-subscriber buffer; events beyond it are dropped and
    /// counted as lag.
    pub buffer_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            in_process: true,
            poll_interval_ms: 100,
            buffer_size: 1000,
        }
    }
}

/// Resource quotas. A value of zero disables the corresponding limit
/// unless noted otherwise.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum experiences per collective (0 = unlimited).
    pub max_experiences_per_collective: u64,

    /// Approximate cap on stored content + embedding bytes (0 = unlimited).
    pub max_total_bytes: u64,

    /// Maximum concurrent read snapshots. Must be nonzero.
    pub max_read_txns: usize,

    /// Deadline for long read scans in milliseconds (0 = no deadline).
    pub query_timeout_ms: u64,

    /// How long a writer waits for the process-local writer lock.
    pub write_lock_timeout_ms: u64,

    /// How long the open call waits for the cross-process file lock.
    pub file_lock_timeout_ms: u64,

    /// Age beyond which an agent activity stops counting as live.
    pub stale_agent_threshold_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_experiences_per_collective: 0,
            max_total_bytes: 0,
            max_read_txns: 100,
            query_timeout_ms: 0,
            write_lock_timeout_ms: 30_000,
            file_lock_timeout_ms: 30_000,
            stale_agent_threshold_ms: 5 * 60 * 1000,
        }
    }
}
