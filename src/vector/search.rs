//! HNSW search: greedy descent plus filtered beam search.
//!
//! Distances are already in "lower is closer" space (see
//! [`graph::distance`](super::graph::distance)), so one heap discipline
//! serves both metrics: a min-heap of candidates to expand and a max-heap
//! of accepted results whose worst element gates further exploration.
//!
//! Filtering happens during traversal: a rejected node still contributes
//! its edges to the walk but never enters the result heap, so aggressive
//! filters do not starve the result set.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::graph::HnswGraph;
use super::VecId;

/// A node with its distance to the query.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    node: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.node == other.node
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the closest candidate first.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

/// Wrapper flipping the order: the farthest accepted result on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Farthest(Candidate);

impl PartialOrd for Farthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Farthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .distance
            .partial_cmp(&other.0.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl HnswGraph {
    /// Walks `layer` greedily toward `query`, returning the local minimum.
    pub(crate) fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        let mut current = entry;
        let mut current_dist = self.distance_to(query, current);
        loop {
            let mut improved = false;
            for &neighbor in self.neighbors(layer, current) {
                let d = self.distance_to(query, neighbor);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search over one layer for construction: every reachable node
    /// is a valid result. Returns up to `ef` nodes, closest first.
    pub(crate) fn search_layer_construction(
        &self,
        query: &[f32],
        entry: u32,
        layer: usize,
        ef: usize,
    ) -> Vec<(u32, f32)> {
        self.search_layer(query, entry, layer, ef, |_| true)
    }

    /// Beam search over one layer with an acceptance predicate.
    ///
    /// Nodes failing `accept` are traversed (their edges stay usable) but
    /// excluded from the results.
    pub(crate) fn search_layer<F>(
        &self,
        query: &[f32],
        entry: u32,
        layer: usize,
        ef: usize,
        accept: F,
    ) -> Vec<(u32, f32)>
    where
        F: Fn(u32) -> bool,
    {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::new();
        let mut results: BinaryHeap<Farthest> = BinaryHeap::new();

        let entry_dist = self.distance_to(query, entry);
        visited.insert(entry);
        frontier.push(Candidate {
            node: entry,
            distance: entry_dist,
        });
        if accept(entry) {
            results.push(Farthest(Candidate {
                node: entry,
                distance: entry_dist,
            }));
        }

        while let Some(current) = frontier.pop() {
            if results.len() >= ef {
                let worst = results.peek().map(|f| f.0.distance).unwrap_or(f32::MAX);
                if current.distance > worst {
                    break;
                }
            }

            for &neighbor in self.neighbors(layer, current.node) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance_to(query, neighbor);

                let worst = if results.len() >= ef {
                    results.peek().map(|f| f.0.distance).unwrap_or(f32::MAX)
                } else {
                    f32::MAX
                };
                if d >= worst {
                    continue;
                }

                frontier.push(Candidate {
                    node: neighbor,
                    distance: d,
                });
                if accept(neighbor) {
                    results.push(Farthest(Candidate {
                        node: neighbor,
                        distance: d,
                    }));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results
            .into_iter()
            .map(|f| (f.0.node, f.0.distance))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Full k-NN: greedy descent from the entry point down to layer 1,
    /// then a filtered beam search at layer 0.
    ///
    /// Returns up to `k` `(id, distance)` pairs, closest first. Nodes
    /// failing `accept` never appear in the output.
    pub(crate) fn search<F>(&self, query: &[f32], k: usize, ef: usize, accept: F) -> Vec<(VecId, f32)>
    where
        F: Fn(&VecId) -> bool,
    {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        let ef = ef.max(k);

        let mut current = entry;
        for layer in (1..=self.max_layer as usize).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        let hits = self.search_layer(query, current, 0, ef, |node| {
            accept(&self.nodes[node as usize].id)
        });

        hits.into_iter()
            .take(k)
            .map(|(node, dist)| (self.nodes[node as usize].id, dist))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::graph::normalize;
    use super::*;
    use crate::config::HnswConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(n: u8) -> VecId {
        let mut bytes = [0u8; 16];
        bytes[0] = n;
        bytes
    }

    fn unit(seed: u64, dim: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim)
            .map(|i| ((seed as f32) * 0.7 + i as f32 * 0.13).sin())
            .collect();
        normalize(&mut v);
        v
    }

    fn build(n: u8, dim: usize) -> HnswGraph {
        let mut graph = HnswGraph::new(dim, HnswConfig::for_scale(1_000));
        let mut rng = StdRng::seed_from_u64(1234);
        for i in 0..n {
            graph.insert(id(i), unit(i as u64, dim), &mut rng);
        }
        graph
    }

    #[test]
    fn test_search_empty_graph() {
        let graph = HnswGraph::new(8, HnswConfig::default());
        assert!(graph.search(&unit(1, 8), 5, 50, |_| true).is_empty());
    }

    #[test]
    fn test_search_finds_exact_match_first() {
        let graph = build(30, 8);
        let query = unit(12, 8);
        let hits = graph.search(&query, 5, 50, |_| true);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, id(12));
        assert!(hits[0].1 < 1e-5, "self-distance should be ~0");
    }

    #[test]
    fn test_results_sorted_and_bounded() {
        let graph = build(40, 8);
        let hits = graph.search(&unit(7, 8), 10, 50, |_| true);
        assert!(hits.len() <= 10);
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "distances must be non-decreasing");
        }
    }

    #[test]
    fn test_k_larger_than_graph() {
        let graph = build(5, 8);
        let hits = graph.search(&unit(1, 8), 100, 100, |_| true);
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn test_filter_during_traversal_keeps_k() {
        let graph = build(60, 8);
        // Reject half the nodes: searching with an aggressive filter must
        // still surface the allowed ones.
        let hits = graph.search(&unit(10, 8), 10, 64, |id| id[0] % 2 == 0);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|(id, _)| id[0] % 2 == 0));
        assert!(hits.len() >= 5, "filtered search returned too few results");
    }

    #[test]
    fn test_filter_everything() {
        let graph = build(20, 8);
        let hits = graph.search(&unit(3, 8), 5, 50, |_| false);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_recall_against_brute_force() {
        let dim = 16;
        let graph = build(120, dim);
        let query = unit(200, dim);

        // Brute-force top 10.
        let mut exact: Vec<(VecId, f32)> = (0..120u8)
            .map(|i| {
                let d = super::super::graph::distance(
                    crate::config::Metric::Cosine,
                    &query,
                    &unit(i as u64, dim),
                );
                (id(i), d)
            })
            .collect();
        exact.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let exact_top: HashSet<VecId> = exact.iter().take(10).map(|(i, _)| *i).collect();

        let hits = graph.search(&query, 10, 120, |_| true);
        let found = hits.iter().filter(|(i, _)| exact_top.contains(i)).count();
        assert!(
            found >= 8,
            "recall too low: only {found}/10 of the exact neighbors found"
        );
    }
}
