//! Noise merge: attach leftover noise points to a sufficiently similar cluster.

use rayon::prelude::*;
use tracing::debug;

use super::types::AssignmentSet;
use crate::util::vector::{cosine_similarity, mean_vector};

/// Mean member vector of every cluster in `assignments`, indexed by cluster.
#[must_use]
pub fn cluster_centroids(vectors: &[Vec<f32>], assignments: &AssignmentSet) -> Vec<Vec<f32>> {
    let dim = vectors.first().map_or(0, Vec::len);
    assignments
        .members()
        .iter()
        .map(|members| mean_vector(vectors, members, dim))
        .collect()
}

/// Reassigns noise to the most similar centroid when that similarity reaches
/// the threshold (inclusive).
///
/// Centroids are computed once from the incoming assignments and stay frozen
/// for the whole pass, so the outcome does not depend on processing order.
/// Equally similar centroids resolve to the lowest cluster id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseMergeStrategy {
    threshold: f32,
}

impl NoiseMergeStrategy {
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Returns a new assignment set; `assignments` is left as is.
    #[must_use]
    pub fn merge(&self, vectors: &[Vec<f32>], assignments: &AssignmentSet) -> AssignmentSet {
        if assignments.n_clusters() == 0 {
            return assignments.clone();
        }

        let centroids = cluster_centroids(vectors, assignments);
        let noise = assignments.noise_indices();

        let reassignments: Vec<(usize, usize)> = noise
            .par_iter()
            .filter_map(|&index| {
                let (cluster, similarity) = nearest_centroid(&vectors[index], &centroids)?;
                (similarity >= self.threshold).then_some((index, cluster))
            })
            .collect();

        debug!(
            noise = noise.len(),
            merged = reassignments.len(),
            threshold = self.threshold,
            "noise merge pass"
        );

        assignments.with_merged(&reassignments)
    }
}

fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (cluster, centroid) in centroids.iter().enumerate() {
        let similarity = cosine_similarity(vector, centroid);
        if best.is_none_or(|(_, current)| similarity > current) {
            best = Some((cluster, similarity));
        }
    }
    best
}
