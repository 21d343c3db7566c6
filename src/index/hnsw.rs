//! HNSW graph backend.
//!
//! Hierarchical navigable small world graph: random layer assignment from an
//! exponential draw, diversity-preserving neighbor selection, greedy beam
//! search. Insert zooms from the top layer down to the node's layer, then
//! wires connections on every layer below; search descends greedily to layer
//! 0 and beam-searches there with `ef` candidates.
//!
//! Restricted search traverses the full graph but only admits labels in the
//! restriction set into the result beam, widening the beam to compensate.
//! Candidates that fail the restriction still route the traversal, so a
//! tight restriction cannot strand the search in a filtered-out region.
//!
//! The index owns its vectors (row-major) and talks about *slots*, dense
//! insertion-order positions, internally. Labels only appear at the API
//! boundary.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::{HnswIndexOption, MetricType};
use crate::simd::{dot_product, l2_distance_squared};

use super::{InsertBatch, SearchOutcome, SearchQuery};

/// Beam width when the query does not specify `ef_search`. Matches the
/// conventional ANN-library default.
const DEFAULT_EF_SEARCH: usize = 16;

/// A node's adjacency lists, one per layer it exists on. Layer 0 holds
/// every node; higher layers thin out for express routing.
struct Node {
    layers: Vec<Vec<usize>>,
}

impl Node {
    fn new(max_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); max_layer + 1],
        }
    }

    fn neighbors(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Min-heap entry for the exploration frontier.
#[derive(Clone, Copy)]
struct Candidate {
    slot: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller distance pops first.
        other.distance.total_cmp(&self.distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry for the result beam, worst on top for cheap eviction.
#[derive(Clone, Copy)]
struct BeamEntry {
    slot: usize,
    distance: f32,
}

impl PartialEq for BeamEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for BeamEntry {}

impl Ord for BeamEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

impl PartialOrd for BeamEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswIndex {
    dim: usize,
    metric: MetricType,

    m: usize,
    m0: usize,
    ml: f64,
    ef_construction: usize,

    /// Row-major vector storage; slot `i` lives at `data[i*dim..(i+1)*dim]`.
    data: Vec<f32>,
    labels: Vec<i64>,

    nodes: Vec<Node>,
    entry_point: Option<usize>,
    max_layer: usize,

    rng: StdRng,
}

impl HnswIndex {
    pub fn new(dim: usize, metric: MetricType, params: &HnswIndexOption) -> Self {
        Self::with_seed(dim, metric, params, rand::random())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(dim: usize, metric: MetricType, params: &HnswIndexOption, seed: u64) -> Self {
        Self {
            dim,
            metric,
            m: params.m,
            m0: params.m * 2,
            ml: 1.0 / (params.m as f64).ln(),
            ef_construction: params.ef_construction,
            data: Vec::new(),
            labels: Vec::new(),
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn ntotal(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    fn vector(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    /// Internal distance: smaller is always better. Inner product is
    /// negated here and negated back at the API boundary.
    #[inline]
    fn distance_to(&self, query: &[f32], slot: usize) -> f32 {
        let vector = self.vector(slot);
        match self.metric {
            MetricType::L2 => l2_distance_squared(query, vector),
            MetricType::Ip => -dot_product(query, vector),
        }
    }

    /// Draw a layer from the exponential distribution. The `1.0 - r` keeps
    /// the argument of `ln` strictly positive.
    fn random_layer(&mut self) -> usize {
        let r: f64 = 1.0 - self.rng.gen::<f64>();
        (-r.ln() * self.ml).floor() as usize
    }

    pub(super) fn insert(&mut self, batch: &InsertBatch<'_>) {
        let first_slot = self.labels.len();
        self.data.extend_from_slice(batch.data);
        self.labels.extend_from_slice(batch.labels);

        for slot in first_slot..first_slot + batch.rows {
            self.insert_slot(slot);
        }
    }

    fn insert_slot(&mut self, slot: usize) {
        let node_layer = self.random_layer();

        let Some(entry_point) = self.entry_point else {
            self.nodes.push(Node::new(node_layer));
            self.entry_point = Some(slot);
            self.max_layer = node_layer;
            return;
        };

        let query = self.vector(slot).to_vec();
        let mut current = entry_point;

        // Zoom in greedily through the layers above the node's own.
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(&(best, _)) = self.search_layer(&query, current, 1, layer, &|_| true).first()
            {
                current = best;
            }
        }

        // Wire connections from min(node_layer, max_layer) down to 0. New
        // edges into existing nodes are collected and applied at the end so
        // the per-layer searches run against a stable graph.
        let mut node = Node::new(node_layer);
        let mut rewires: Vec<(usize, usize, Vec<usize>)> = Vec::new();

        for layer in (0..=node_layer.min(self.max_layer)).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };

            let candidates = self.search_layer(&query, current, self.ef_construction, layer, &|_| {
                true
            });
            let neighbors = self.select_neighbors(&query, &candidates, m_layer);

            for &(neighbor, _) in &neighbors {
                node.layers[layer].push(neighbor);

                let mut list = self.nodes[neighbor].neighbors(layer).to_vec();
                if !list.contains(&slot) {
                    list.push(slot);
                }
                if list.len() > m_layer {
                    // Re-select the neighbor's adjacency from its own vantage
                    // point, keeping the diversity property.
                    let anchor = self.vector(neighbor).to_vec();
                    let ranked: Vec<(usize, f32)> = list
                        .iter()
                        .map(|&s| (s, self.distance_to(&anchor, s)))
                        .collect();
                    list = self
                        .select_neighbors(&anchor, &ranked, m_layer)
                        .into_iter()
                        .map(|(s, _)| s)
                        .collect();
                }
                rewires.push((neighbor, layer, list));
            }

            if let Some(&(best, _)) = candidates.first() {
                current = best;
            }
        }

        debug_assert_eq!(self.nodes.len(), slot);
        self.nodes.push(node);
        for (neighbor, layer, list) in rewires {
            self.nodes[neighbor].layers[layer] = list;
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(slot);
        }
    }

    /// Greedy beam search on one layer. `admit` gates entry into the result
    /// beam only; rejected slots still extend the frontier.
    fn search_layer(
        &self,
        query: &[f32],
        entry: usize,
        ef: usize,
        layer: usize,
        admit: &dyn Fn(usize) -> bool,
    ) -> Vec<(usize, f32)> {
        let mut visited = vec![false; self.nodes.len()];
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut beam: BinaryHeap<BeamEntry> = BinaryHeap::with_capacity(ef + 1);

        visited[entry] = true;
        let entry_distance = self.distance_to(query, entry);
        frontier.push(Candidate {
            slot: entry,
            distance: entry_distance,
        });
        if admit(entry) {
            beam.push(BeamEntry {
                slot: entry,
                distance: entry_distance,
            });
        }

        while let Some(current) = frontier.pop() {
            if let Some(worst) = beam.peek() {
                if current.distance > worst.distance && beam.len() >= ef {
                    break;
                }
            }

            for &neighbor in self.nodes[current.slot].neighbors(layer) {
                if visited[neighbor] {
                    continue;
                }
                visited[neighbor] = true;

                let distance = self.distance_to(query, neighbor);
                let dominated =
                    beam.len() >= ef && distance > beam.peek().map_or(f32::INFINITY, |w| w.distance);
                if dominated {
                    continue;
                }

                frontier.push(Candidate {
                    slot: neighbor,
                    distance,
                });
                if admit(neighbor) {
                    beam.push(BeamEntry {
                        slot: neighbor,
                        distance,
                    });
                    if beam.len() > ef {
                        beam.pop();
                    }
                }
            }
        }

        let mut found: Vec<(usize, f32)> = beam
            .into_iter()
            .map(|entry| (entry.slot, entry.distance))
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1));
        found
    }

    /// Diversity-preserving neighbor selection: a candidate joins only if it
    /// is closer to the query than to every already-selected neighbor, with
    /// a closest-first fill when diversity leaves slots unused.
    fn select_neighbors(
        &self,
        _query: &[f32],
        candidates: &[(usize, f32)],
        m: usize,
    ) -> Vec<(usize, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(m);
        for &(candidate, candidate_distance) in &sorted {
            if selected.len() >= m {
                break;
            }
            let candidate_vector = self.vector(candidate).to_vec();
            let diverse = selected.iter().all(|&(existing, _)| {
                self.distance_to(&candidate_vector, existing) >= candidate_distance
            });
            if diverse {
                selected.push((candidate, candidate_distance));
            }
        }

        if selected.len() < m {
            for &(candidate, candidate_distance) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(s, _)| s == candidate) {
                    selected.push((candidate, candidate_distance));
                }
            }
        }

        selected
    }

    pub(super) fn search(&self, query: &SearchQuery<'_>, k: usize) -> SearchOutcome {
        let Some(entry_point) = self.entry_point else {
            return SearchOutcome {
                distances: Vec::new(),
                labels: Vec::new(),
            };
        };

        // Greedy descent to layer 1, unrestricted: hub nodes route the
        // search even when filtered out of the results.
        let mut current = entry_point;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(best, _)) =
                self.search_layer(query.vector, current, 1, layer, &|_| true).first()
            {
                current = best;
            }
        }

        let ef = query.ef_search.unwrap_or(DEFAULT_EF_SEARCH);
        let restriction = query.restriction.filter(|bitmap| !bitmap.is_empty());

        let found = match restriction {
            Some(bitmap) => {
                // Widen the beam: many candidates will fail the restriction.
                let ef_effective = (ef * 2).max(k * 4);
                let admit = |slot: usize| {
                    let label = self.labels[slot];
                    label >= 0 && bitmap.contains(label as u32)
                };
                self.search_layer(query.vector, current, ef_effective, 0, &admit)
            }
            None => self.search_layer(query.vector, current, ef.max(k), 0, &|_| true),
        };

        let mut outcome = SearchOutcome {
            distances: Vec::with_capacity(k),
            labels: Vec::with_capacity(k),
        };
        for (slot, distance) in found.into_iter().take(k) {
            outcome.labels.push(self.labels[slot]);
            outcome.distances.push(match self.metric {
                MetricType::L2 => distance,
                MetricType::Ip => -distance,
            });
        }
        outcome
    }
}
