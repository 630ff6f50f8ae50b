//! Per-collective vector index.
//!
//! [`HnswIndex`] wraps the graph behind a reader-writer lock: searches run
//! concurrently, mutation takes the writer side. Deletes are tombstones;
//! the graph keeps the node (removing it would break proximity edges other
//! nodes rely on) and searches skip it. Once tombstones pass the
//! configured ratio the index asks for a rebuild at the next save point.
//!
//! The KV store owns embedding bytes; this index is a derived artifact.
//! It persists to a `.hnsw` file (bincode graph image) with a JSON `.meta`
//! sidecar recording `{element_count, dimension, params, built_at_csn}`.
//! On load failure or staleness the caller rebuilds from stored
//! embeddings.

pub(crate) mod graph;
mod search;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{HnswConfig, Metric};
use crate::error::{PulseError, Result};
use crate::types::Csn;
use graph::{normalize, GraphSnapshot, HnswGraph};

/// Raw bytes of an external id (experience or insight).
pub type VecId = [u8; 16];

/// JSON sidecar describing a persisted index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Active (non-tombstoned) vectors at save time.
    pub element_count: usize,
    /// Vector dimension.
    pub dimension: usize,
    /// Connectivity parameter the graph was built with.
    pub m: usize,
    /// Construction beam width.
    pub ef_construction: usize,
    /// Default search beam width.
    pub ef_search: usize,
    /// CSN the index was consistent with when saved.
    pub built_at_csn: u64,
}

/// Thread-safe HNSW index over `(id, vector)` pairs.
pub struct HnswIndex {
    graph: RwLock<HnswGraph>,
    deleted: RwLock<HashSet<VecId>>,
    config: HnswConfig,
    dimension: usize,
}

impl HnswIndex {
    /// An empty index for the given dimension.
    pub fn new(dimension: usize, config: &HnswConfig) -> Self {
        Self {
            graph: RwLock::new(HnswGraph::new(dimension, config.clone())),
            deleted: RwLock::new(HashSet::new()),
            config: config.clone(),
            dimension,
        }
    }

    /// The vector dimension this index accepts.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of active (non-tombstoned) vectors.
    pub fn len(&self) -> usize {
        let total = self.graph.read().node_count();
        total - self.deleted.read().len()
    }

    /// True when no active vector is present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of graph nodes that are tombstones.
    pub fn tombstone_ratio(&self) -> f64 {
        let total = self.graph.read().node_count();
        if total == 0 {
            return 0.0;
        }
        self.deleted.read().len() as f64 / total as f64
    }

    /// True once the tombstone ratio crossed the rebuild threshold.
    pub fn wants_rebuild(&self) -> bool {
        self.tombstone_ratio() > self.config.rebuild_tombstone_ratio
    }

    /// True when `id` is an active member.
    pub fn contains(&self, id: &VecId) -> bool {
        self.graph.read().contains(id) && !self.deleted.read().contains(id)
    }

    /// Inserts a vector. Re-inserting a tombstoned id revives it; inserting
    /// a live id is a no-op.
    pub fn insert(&self, id: VecId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(PulseError::vector(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        {
            let graph = self.graph.read();
            if graph.contains(&id) {
                drop(graph);
                self.deleted.write().remove(&id);
                return Ok(());
            }
        }

        let mut prepared = vector.to_vec();
        if matches!(self.config.metric, Metric::Cosine) {
            normalize(&mut prepared);
        }

        let mut graph = self.graph.write();
        graph.insert(id, prepared, &mut rand::thread_rng());
        Ok(())
    }

    /// Tombstones `id`. Unknown ids are ignored (idempotent).
    pub fn remove(&self, id: &VecId) {
        if self.graph.read().contains(id) {
            self.deleted.write().insert(*id);
        }
    }

    /// k-NN search with an optional acceptance predicate evaluated during
    /// traversal. Tombstoned ids never appear. Returns `(id, distance)`
    /// pairs, closest first.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        accept: Option<&dyn Fn(&VecId) -> bool>,
    ) -> Result<Vec<(VecId, f32)>> {
        if query.len() != self.dimension {
            return Err(PulseError::vector(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let mut prepared = query.to_vec();
        if matches!(self.config.metric, Metric::Cosine) {
            normalize(&mut prepared);
        }

        let graph = self.graph.read();
        let deleted = self.deleted.read();
        let hits = graph.search(&prepared, k, ef, |id| {
            !deleted.contains(id) && accept.map_or(true, |f| f(id))
        });
        Ok(hits)
    }

    /// Builds an index from `(id, vector)` pairs. Vector preparation
    /// (normalization) runs in parallel; graph wiring is sequential.
    pub fn build(
        dimension: usize,
        config: &HnswConfig,
        items: Vec<(VecId, Vec<f32>)>,
    ) -> Result<Self> {
        let cosine = matches!(config.metric, Metric::Cosine);
        let prepared: Vec<(VecId, Vec<f32>)> = items
            .into_par_iter()
            .map(|(id, mut vector)| {
                if cosine {
                    normalize(&mut vector);
                }
                (id, vector)
            })
            .collect();

        let mut graph = HnswGraph::new(dimension, config.clone());
        let mut rng = rand::thread_rng();
        for (id, vector) in prepared {
            if vector.len() != dimension {
                return Err(PulseError::vector(format!(
                    "vector dimension mismatch during rebuild: expected {dimension}, got {}",
                    vector.len()
                )));
            }
            graph.insert(id, vector, &mut rng);
        }

        Ok(Self {
            graph: RwLock::new(graph),
            deleted: RwLock::new(HashSet::new()),
            config: config.clone(),
            dimension,
        })
    }

    /// Persists the graph image and its meta sidecar.
    pub fn save(&self, index_path: &Path, built_at_csn: Csn) -> Result<()> {
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (snapshot, active) = {
            let graph = self.graph.read();
            let deleted = self.deleted.read();
            let snapshot = graph.snapshot(deleted.iter().copied().collect());
            let active = graph.node_count() - deleted.len();
            (snapshot, active)
        };

        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| PulseError::vector(format!("failed to encode index: {e}")))?;
        fs::write(index_path, bytes)?;

        let meta = IndexMeta {
            element_count: active,
            dimension: self.dimension,
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            ef_search: self.config.ef_search,
            built_at_csn: built_at_csn.0,
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| PulseError::vector(format!("failed to encode index meta: {e}")))?;
        fs::write(meta_path(index_path), meta_json)?;

        debug!(path = %index_path.display(), vectors = active, csn = built_at_csn.0, "index saved");
        Ok(())
    }

    /// Loads a persisted index. Returns `None` when no file exists;
    /// errors when the file is unreadable or its dimension disagrees, in
    /// which case the caller rebuilds from storage.
    pub fn load(
        index_path: &Path,
        expected_dimension: usize,
        config: &HnswConfig,
    ) -> Result<Option<(Self, IndexMeta)>> {
        if !index_path.exists() {
            return Ok(None);
        }

        let meta_json = fs::read_to_string(meta_path(index_path))
            .map_err(|e| PulseError::vector(format!("failed to read index meta: {e}")))?;
        let meta: IndexMeta = serde_json::from_str(&meta_json)
            .map_err(|e| PulseError::vector(format!("failed to parse index meta: {e}")))?;

        if meta.dimension != expected_dimension {
            return Err(PulseError::vector(format!(
                "index dimension {} does not match collective dimension {expected_dimension}",
                meta.dimension
            )));
        }

        let bytes = fs::read(index_path)?;
        let snapshot: GraphSnapshot = bincode::deserialize(&bytes)
            .map_err(|e| PulseError::vector(format!("failed to decode index: {e}")))?;
        if snapshot.dimension != expected_dimension {
            return Err(PulseError::vector(format!(
                "index graph dimension {} does not match collective dimension {expected_dimension}",
                snapshot.dimension
            )));
        }

        let deleted: HashSet<VecId> = snapshot.deleted.iter().copied().collect();
        let graph = HnswGraph::restore(snapshot, config.clone());

        Ok(Some((
            Self {
                graph: RwLock::new(graph),
                deleted: RwLock::new(deleted),
                config: config.clone(),
                dimension: expected_dimension,
            },
            meta,
        )))
    }

    /// Removes the index files, ignoring already-missing ones.
    pub fn remove_files(index_path: &Path) -> Result<()> {
        for path in [index_path.to_path_buf(), meta_path(index_path)] {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to remove index file");
                }
            }
        }
        Ok(())
    }
}

fn meta_path(index_path: &Path) -> std::path::PathBuf {
    let mut os = index_path.as_os_str().to_owned();
    os.push(".meta");
    std::path::PathBuf::from(os)
}
