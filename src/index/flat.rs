//! Exact k-NN by linear scan.
//!
//! The baseline backend: every query touches every vector. Used for small
//! databases and as ground truth for the graph backend's tests.

use crate::model::MetricType;
use crate::simd::{dot_product, l2_distance_squared};

use super::{admits, InsertBatch, SearchOutcome, SearchQuery};

pub struct FlatIndex {
    dim: usize,
    metric: MetricType,
    data: Vec<f32>,
    labels: Vec<i64>,
}

impl FlatIndex {
    pub fn new(dim: usize, metric: MetricType) -> Self {
        Self {
            dim,
            metric,
            data: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn ntotal(&self) -> usize {
        self.labels.len()
    }

    pub(super) fn insert(&mut self, batch: &InsertBatch<'_>) {
        self.data.extend_from_slice(batch.data);
        self.labels.extend_from_slice(batch.labels);
    }

    pub(super) fn search(&self, query: &SearchQuery<'_>, k: usize) -> SearchOutcome {
        let mut scored: Vec<(f32, i64)> = Vec::with_capacity(self.labels.len());
        for (row, &label) in self.labels.iter().enumerate() {
            if !admits(query.restriction, label) {
                continue;
            }
            let vector = &self.data[row * self.dim..(row + 1) * self.dim];
            let score = match self.metric {
                MetricType::L2 => l2_distance_squared(query.vector, vector),
                MetricType::Ip => dot_product(query.vector, vector),
            };
            scored.push((score, label));
        }

        match self.metric {
            MetricType::L2 => scored.sort_by(|a, b| a.0.total_cmp(&b.0)),
            MetricType::Ip => scored.sort_by(|a, b| b.0.total_cmp(&a.0)),
        }
        scored.truncate(k);

        SearchOutcome {
            distances: scored.iter().map(|&(score, _)| score).collect(),
            labels: scored.iter().map(|&(_, label)| label).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roaring::RoaringBitmap;

    fn build(metric: MetricType) -> FlatIndex {
        let mut index = FlatIndex::new(3, metric);
        index.insert(&InsertBatch {
            rows: 3,
            cols: 3,
            data: &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 10.0, 10.0, 10.0],
            labels: &[1, 2, 3],
        });
        index
    }

    #[test]
    fn test_l2_orders_ascending() {
        let index = build(MetricType::L2);
        let outcome = index.search(&SearchQuery::new(&[1.0, 0.0, 0.0]), 3);
        assert_eq!(outcome.labels, vec![1, 2, 3]);
        assert_eq!(outcome.distances[0], 0.0);
        assert!(outcome.distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_ip_orders_descending() {
        let index = build(MetricType::Ip);
        let outcome = index.search(&SearchQuery::new(&[1.0, 1.0, 1.0]), 3);
        assert_eq!(outcome.labels[0], 3, "largest inner product first");
        assert!(outcome.distances.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_k_truncates() {
        let index = build(MetricType::L2);
        let outcome = index.search(&SearchQuery::new(&[0.0, 0.0, 0.0]), 2);
        assert_eq!(outcome.labels.len(), 2);
    }

    #[test]
    fn test_restriction_prunes_candidates() {
        let index = build(MetricType::L2);
        let mut allowed = RoaringBitmap::new();
        allowed.insert(3);

        let query = SearchQuery {
            vector: &[1.0, 0.0, 0.0],
            restriction: Some(&allowed),
            ef_search: None,
        };
        let outcome = index.search(&query, 3);
        assert_eq!(outcome.labels, vec![3]);
    }

    #[test]
    fn test_empty_restriction_is_unrestricted() {
        let index = build(MetricType::L2);
        let empty = RoaringBitmap::new();
        let query = SearchQuery {
            vector: &[1.0, 0.0, 0.0],
            restriction: Some(&empty),
            ef_search: None,
        };
        let outcome = index.search(&query, 3);
        assert_eq!(outcome.labels.len(), 3);
    }
}
