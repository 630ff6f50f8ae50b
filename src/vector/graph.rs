//! HNSW graph structure and construction.
//!
//! The graph is a stack of navigable small-world layers. Layer 0 holds
//! every node; each higher layer holds an exponentially thinning subset,
//! acting as express lanes toward the query's neighborhood. Nodes own a
//! copy of their vector (normalized for cosine), so the graph answers
//! distance computations without touching storage.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{HnswConfig, Metric};

use super::VecId;

/// A node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HnswNode {
    /// External id the vector belongs to.
    pub id: VecId,
    /// The vector, normalized when the metric is cosine.
    pub vector: Vec<f32>,
    /// Highest layer this node appears in.
    pub max_layer: u8,
}

/// The multi-layer graph.
#[derive(Debug)]
pub(crate) struct HnswGraph {
    /// All nodes, indexed by internal node id.
    pub(crate) nodes: Vec<HnswNode>,

    /// External id to internal node id.
    pub(crate) id_to_node: HashMap<VecId, u32>,

    /// Adjacency per layer: `connections[layer][node]` lists neighbor ids.
    pub(crate) connections: Vec<Vec<Vec<u32>>>,

    /// Node the search descends from (a node on the top layer).
    pub(crate) entry_point: Option<u32>,

    /// Highest populated layer.
    pub(crate) max_layer: u8,

    pub(crate) config: HnswConfig,
    pub(crate) dimension: usize,
}

/// Serializable image of a graph for the sidecar file.
#[derive(Serialize, Deserialize)]
pub(crate) struct GraphSnapshot {
    pub dimension: usize,
    pub nodes: Vec<HnswNode>,
    pub connections: Vec<Vec<Vec<u32>>>,
    pub entry_point: Option<u32>,
    pub max_layer: u8,
    pub deleted: Vec<VecId>,
}

impl HnswGraph {
    /// An empty graph.
    pub fn new(dimension: usize, config: HnswConfig) -> Self {
        Self {
            nodes: Vec::new(),
            id_to_node: HashMap::new(),
            connections: Vec::new(),
            entry_point: None,
            max_layer: 0,
            config,
            dimension,
        }
    }

    /// Reassembles a graph from its serialized image.
    pub fn restore(snapshot: GraphSnapshot, config: HnswConfig) -> Self {
        let id_to_node = snapshot
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, i as u32))
            .collect();
        Self {
            id_to_node,
            nodes: snapshot.nodes,
            connections: snapshot.connections,
            entry_point: snapshot.entry_point,
            max_layer: snapshot.max_layer,
            config,
            dimension: snapshot.dimension,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &VecId) -> bool {
        self.id_to_node.contains_key(id)
    }

    pub fn node_id(&self, id: &VecId) -> Option<u32> {
        self.id_to_node.get(id).copied()
    }

    /// Neighbors of `node` at `layer`; empty when the node is absent from
    /// that layer.
    pub fn neighbors(&self, layer: usize, node: u32) -> &[u32] {
        self.connections
            .get(layer)
            .and_then(|l| l.get(node as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distance from `query` to a stored node. Lower is closer for both
    /// metrics: cosine distance `1 - dot` over normalized vectors, or
    /// squared L2.
    #[inline]
    pub fn distance_to(&self, query: &[f32], node: u32) -> f32 {
        distance(self.config.metric, query, &self.nodes[node as usize].vector)
    }

    /// Draws a layer from the exponential distribution `floor(-ln(u)·ml)`.
    pub fn random_layer<R: Rng>(&self, rng: &mut R) -> u8 {
        let uniform: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        let layer = (-uniform.ln() * self.config.ml).floor() as u64;
        layer.min(32) as u8
    }

    /// Inserts a vector, wiring connections from its drawn layer down to
    /// layer 0. No-op when the id is already present.
    pub fn insert<R: Rng>(&mut self, id: VecId, vector: Vec<f32>, rng: &mut R) {
        if self.contains(&id) {
            return;
        }
        debug_assert_eq!(vector.len(), self.dimension);

        let level = self.random_layer(rng);
        let old_entry = self.entry_point;
        let old_max_layer = self.max_layer;

        let node = self.push_node(id, vector, level);

        let Some(entry) = old_entry else {
            // First node becomes the entry point.
            self.entry_point = Some(node);
            self.max_layer = level;
            return;
        };

        let query = self.nodes[node as usize].vector.clone();

        // Greedy descent through the layers above the new node's level.
        let mut current = entry;
        for layer in ((level as usize + 1)..=(old_max_layer as usize)).rev() {
            current = self.greedy_closest(&query, current, layer);
        }

        // Wire each layer from min(level, old_max) down to 0.
        let top = (level as usize).min(old_max_layer as usize);
        for layer in (0..=top).rev() {
            let candidates =
                self.search_layer_construction(&query, current, layer, self.config.ef_construction);
            current = candidates.first().map(|&(n, _)| n).unwrap_or(current);

            let m = self.config.m;
            let chosen: Vec<u32> = candidates.iter().take(m).map(|&(n, _)| n).collect();

            self.connections[layer][node as usize] = chosen.clone();
            let cap = self.layer_capacity(layer);
            for neighbor in chosen {
                let list = &mut self.connections[layer][neighbor as usize];
                if !list.contains(&node) {
                    list.push(node);
                }
                if self.connections[layer][neighbor as usize].len() > cap {
                    self.shrink_neighbors(layer, neighbor, cap);
                }
            }
        }

        if level > old_max_layer {
            self.entry_point = Some(node);
            self.max_layer = level;
        }
    }

    /// Appends a node and sizes the adjacency storage for it.
    fn push_node(&mut self, id: VecId, vector: Vec<f32>, max_layer: u8) -> u32 {
        let node = self.nodes.len() as u32;
        self.nodes.push(HnswNode {
            id,
            vector,
            max_layer,
        });
        self.id_to_node.insert(id, node);

        while self.connections.len() <= max_layer as usize {
            self.connections.push(Vec::new());
        }
        for layer in &mut self.connections {
            while layer.len() <= node as usize {
                layer.push(Vec::new());
            }
        }
        node
    }

    /// Maximum neighbor list length for a layer.
    #[inline]
    pub fn layer_capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max0
        } else {
            self.config.m_max
        }
    }

    /// Keeps the `cap` closest neighbors of `node` at `layer`.
    fn shrink_neighbors(&mut self, layer: usize, node: u32, cap: usize) {
        let anchor = self.nodes[node as usize].vector.clone();
        let mut scored: Vec<(u32, f32)> = self.connections[layer][node as usize]
            .iter()
            .map(|&n| (n, distance(self.config.metric, &anchor, &self.nodes[n as usize].vector)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(cap);
        self.connections[layer][node as usize] = scored.into_iter().map(|(n, _)| n).collect();
    }

    /// Takes the serializable image of this graph.
    pub fn snapshot(&self, deleted: Vec<VecId>) -> GraphSnapshot {
        GraphSnapshot {
            dimension: self.dimension,
            nodes: self.nodes.clone(),
            connections: self.connections.clone(),
            entry_point: self.entry_point,
            max_layer: self.max_layer,
            deleted,
        }
    }
}

/// Distance in a space where lower is always closer.
#[inline]
pub(crate) fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => 1.0 - dot(a, b),
        Metric::L2 => l2_squared(a, b),
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Normalizes to unit length; zero vectors are left untouched.
pub(crate) fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_config() -> HnswConfig {
        let mut config = HnswConfig::for_scale(1_000);
        config.metric = Metric::Cosine;
        config
    }

    fn unit(seed: u64, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim)
            .map(|i| ((seed as f32) * 0.7 + i as f32 * 0.13).sin())
            .collect();
        normalize(&mut v);
        v
    }

    fn id(n: u8) -> VecId {
        let mut bytes = [0u8; 16];
        bytes[0] = n;
        bytes
    }

    #[test]
    fn test_empty_graph() {
        let graph = HnswGraph::new(8, test_config());
        assert!(graph.is_empty());
        assert!(graph.entry_point.is_none());
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_first_insert_becomes_entry() {
        let mut graph = HnswGraph::new(8, test_config());
        let mut rng = StdRng::seed_from_u64(7);
        graph.insert(id(1), unit(1, 8), &mut rng);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.entry_point, Some(0));
        assert!(graph.contains(&id(1)));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut graph = HnswGraph::new(8, test_config());
        let mut rng = StdRng::seed_from_u64(7);
        graph.insert(id(1), unit(1, 8), &mut rng);
        graph.insert(id(1), unit(1, 8), &mut rng);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_connections_are_bidirectional_at_layer0() {
        let mut graph = HnswGraph::new(8, test_config());
        let mut rng = StdRng::seed_from_u64(42);
        for n in 0..20u8 {
            graph.insert(id(n), unit(n as u64, 8), &mut rng);
        }
        for node in 0..20u32 {
            for &neighbor in graph.neighbors(0, node) {
                assert!(
                    graph.neighbors(0, neighbor).contains(&node),
                    "layer-0 edge {node}->{neighbor} has no reverse edge"
                );
            }
        }
    }

    #[test]
    fn test_neighbor_lists_respect_capacity() {
        let mut graph = HnswGraph::new(4, test_config());
        let mut rng = StdRng::seed_from_u64(3);
        for n in 0..100u8 {
            graph.insert(id(n), unit(n as u64, 4), &mut rng);
        }
        for layer in 0..graph.connections.len() {
            let cap = graph.layer_capacity(layer);
            for node in 0..graph.node_count() as u32 {
                assert!(
                    graph.neighbors(layer, node).len() <= cap,
                    "layer {layer} node {node} exceeds capacity {cap}"
                );
            }
        }
    }

    #[test]
    fn test_random_layer_distribution() {
        let graph = HnswGraph::new(8, test_config());
        let mut rng = StdRng::seed_from_u64(9);
        let mut counts = [0usize; 8];
        for _ in 0..10_000 {
            let layer = graph.random_layer(&mut rng) as usize;
            if layer < counts.len() {
                counts[layer] += 1;
            }
        }
        assert!(counts[0] > counts[1]);
        assert!(counts[1] > counts[2]);
        assert!(counts[0] > 5_000, "most nodes should land on layer 0");
    }

    #[test]
    fn test_distance_cosine() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((distance(Metric::Cosine, &a, &a)).abs() < 1e-6);
        assert!((distance(Metric::Cosine, &a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_l2() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((distance(Metric::L2, &a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut graph = HnswGraph::new(8, test_config());
        let mut rng = StdRng::seed_from_u64(11);
        for n in 0..15u8 {
            graph.insert(id(n), unit(n as u64, 8), &mut rng);
        }

        let snapshot = graph.snapshot(vec![id(3)]);
        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: GraphSnapshot = bincode::deserialize(&bytes).unwrap();
        let restored = HnswGraph::restore(decoded, test_config());

        assert_eq!(restored.node_count(), graph.node_count());
        assert_eq!(restored.entry_point, graph.entry_point);
        assert_eq!(restored.max_layer, graph.max_layer);
        assert_eq!(restored.node_id(&id(7)), graph.node_id(&id(7)));
    }
}
