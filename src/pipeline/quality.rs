//! Cluster quality gate.
//!
//! Scores every cluster on two axes and dissolves the ones that fail:
//!
//! - **cohesion**: mean pairwise cosine similarity between members. A
//!   singleton scores 1.0.
//! - **separation**: `1 - max cosine similarity` between the cluster's centroid
//!   and any other centroid. A lone cluster scores 1.0.
//!
//! Removing a cluster can only raise the separation of the others, so every
//! survivor of a single gate pass satisfies both thresholds.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::merge::cluster_centroids;
use super::types::AssignmentSet;
use crate::util::vector::cosine_similarity;

/// Demotion thresholds. A cluster is demoted when either score is strictly below.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_cohesion: f32,
    pub min_separation: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_cohesion: 0.4,
            min_separation: 0.15,
        }
    }
}

/// Scores for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterQuality {
    pub cluster: usize,
    pub size: usize,
    pub cohesion: f32,
    pub separation: f32,
}

impl ClusterQuality {
    #[must_use]
    pub fn passes(&self, thresholds: &QualityThresholds) -> bool {
        self.cohesion >= thresholds.min_cohesion && self.separation >= thresholds.min_separation
    }
}

/// Outcome of one gate pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub assignments: AssignmentSet,
    /// Scores of the surviving clusters, indexed by their new cluster number.
    pub qualities: Vec<ClusterQuality>,
    /// Centroids of the surviving clusters, same indexing.
    pub centroids: Vec<Vec<f32>>,
    pub demoted: usize,
}

/// Computes mean pairwise cosine similarity of the given unit vectors.
///
/// Uses `(|Σv|² - Σ|v|²) / (n(n-1))`, which equals the average dot product
/// over distinct pairs without the O(n²) loop.
///
/// # Returns
/// 1.0 for fewer than two members.
#[must_use]
pub fn compute_cohesion(vectors: &[Vec<f32>], members: &[usize]) -> f32 {
    if members.len() < 2 {
        return 1.0;
    }
    let dim = vectors[members[0]].len();
    let mut sum = vec![0.0_f64; dim];
    let mut self_dot = 0.0_f64;
    for &index in members {
        for (acc, value) in sum.iter_mut().zip(&vectors[index]) {
            *acc += f64::from(*value);
        }
        self_dot += vectors[index]
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>();
    }
    let total: f64 = sum.iter().map(|v| v * v).sum();
    #[allow(clippy::cast_precision_loss)]
    let pairs = (members.len() * (members.len() - 1)) as f64;
    #[allow(clippy::cast_possible_truncation)]
    let cohesion = ((total - self_dot) / pairs) as f32;
    cohesion
}

/// Computes `1 - max similarity` between centroid `index` and every other centroid.
///
/// # Returns
/// 1.0 when there is no other centroid.
#[must_use]
pub fn compute_separation(index: usize, centroids: &[Vec<f32>]) -> f32 {
    centroids
        .iter()
        .enumerate()
        .filter(|(other, _)| *other != index)
        .map(|(_, centroid)| cosine_similarity(&centroids[index], centroid))
        .fold(None, |best: Option<f32>, similarity| {
            Some(best.map_or(similarity, |b| b.max(similarity)))
        })
        .map_or(1.0, |max_similarity| 1.0 - max_similarity)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClusterQualityGate {
    thresholds: QualityThresholds,
}

impl ClusterQualityGate {
    #[must_use]
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Scores every cluster in `assignments`. Clusters are scored in parallel.
    #[must_use]
    pub fn evaluate(
        &self,
        vectors: &[Vec<f32>],
        assignments: &AssignmentSet,
    ) -> (Vec<ClusterQuality>, Vec<Vec<f32>>) {
        let members = assignments.members();
        let centroids = cluster_centroids(vectors, assignments);
        let qualities = members
            .par_iter()
            .enumerate()
            .map(|(cluster, members)| ClusterQuality {
                cluster,
                size: members.len(),
                cohesion: compute_cohesion(vectors, members),
                separation: compute_separation(cluster, &centroids),
            })
            .collect();
        (qualities, centroids)
    }

    /// Demotes failing clusters to noise and rescores the survivors.
    /// Demoted members are not offered to the merge step again.
    #[must_use]
    pub fn apply(&self, vectors: &[Vec<f32>], assignments: &AssignmentSet) -> GateOutcome {
        let (qualities, _) = self.evaluate(vectors, assignments);
        let failing: Vec<usize> = qualities
            .iter()
            .filter(|quality| !quality.passes(&self.thresholds))
            .map(|quality| quality.cluster)
            .collect();

        for quality in qualities.iter().filter(|q| failing.contains(&q.cluster)) {
            debug!(
                cluster = quality.cluster,
                size = quality.size,
                cohesion = quality.cohesion,
                separation = quality.separation,
                "demoting cluster"
            );
        }

        let gated = assignments.with_demoted(&failing);
        let (qualities, centroids) = self.evaluate(vectors, &gated);

        info!(
            evaluated = assignments.n_clusters(),
            demoted = failing.len(),
            remaining = gated.n_clusters(),
            "quality gate applied"
        );

        GateOutcome {
            assignments: gated,
            qualities,
            centroids,
            demoted: failing.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Stage;
    use crate::util::vector::l2_normalized;

    #[test]
    fn test_cohesion_singleton_is_one() {
        let vectors = vec![vec![1.0, 0.0]];
        assert!((compute_cohesion(&vectors, &[0]) - 1.0).abs() < f32::EPSILON);
        assert!((compute_cohesion(&vectors, &[]) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_cohesion_matches_pairwise_mean() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            l2_normalized(&[1.0, 1.0, 0.0]),
            vec![0.0, 0.0, 1.0],
        ];
        let pairwise = (cosine_similarity(&vectors[0], &vectors[1])
            + cosine_similarity(&vectors[0], &vectors[2])
            + cosine_similarity(&vectors[1], &vectors[2]))
            / 3.0;
        assert!((compute_cohesion(&vectors, &[0, 1, 2]) - pairwise).abs() < 1e-5);
    }

    #[test]
    fn test_cohesion_of_orthogonal_members_is_zero() {
        let vectors = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        assert!(compute_cohesion(&vectors, &[0, 1, 2]).abs() < 1e-6);
    }

    #[test]
    fn test_separation_single_cluster_is_one() {
        let centroids = vec![vec![1.0, 0.0]];
        assert!((compute_separation(0, &centroids) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_separation_uses_nearest_centroid() {
        let centroids = vec![vec![1.0, 0.0], vec![0.0, 1.0], l2_normalized(&[1.0, 1.0])];
        let expected = 1.0 - cosine_similarity(&centroids[0], &centroids[2]);
        assert!((compute_separation(0, &centroids) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_loose_cluster_is_demoted() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ];
        let labels =
            AssignmentSet::from_density_labels(vec![Some(0), Some(0), Some(1), Some(1), Some(1)]);

        let outcome = ClusterQualityGate::default().apply(&vectors, &labels);

        assert_eq!(outcome.demoted, 1);
        assert_eq!(outcome.assignments.labels(), &[Some(0), Some(0), None, None, None]);
        assert_eq!(outcome.assignments.stages()[3], Stage::Noise);
        assert_eq!(outcome.qualities.len(), 1);
    }

    #[test]
    fn test_overlapping_clusters_are_demoted() {
        let vectors = vec![
            l2_normalized(&[1.0, 0.00]),
            l2_normalized(&[1.0, 0.01]),
            l2_normalized(&[1.0, 0.02]),
            l2_normalized(&[1.0, 0.03]),
        ];
        let labels = AssignmentSet::from_density_labels(vec![Some(0), Some(0), Some(1), Some(1)]);

        let outcome = ClusterQualityGate::default().apply(&vectors, &labels);

        assert_eq!(outcome.demoted, 2);
        assert_eq!(outcome.assignments.n_clusters(), 0);
    }

    #[test]
    fn test_survivors_satisfy_thresholds() {
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            l2_normalized(&[1.0, 0.1, 0.0]),
            vec![0.0, 1.0, 0.0],
            l2_normalized(&[0.1, 1.0, 0.0]),
            l2_normalized(&[0.7, 0.7, 0.1]),
            l2_normalized(&[0.6, 0.8, 0.0]),
            vec![0.0, 0.0, 1.0],
        ];
        let labels = AssignmentSet::from_density_labels(vec![
            Some(0),
            Some(0),
            Some(1),
            Some(1),
            Some(2),
            Some(2),
            Some(3),
        ]);
        let gate = ClusterQualityGate::new(QualityThresholds {
            min_cohesion: 0.5,
            min_separation: 0.3,
        });

        let outcome = gate.apply(&vectors, &labels);

        assert!(outcome.demoted >= 1);
        assert!(outcome
            .qualities
            .iter()
            .all(|quality| quality.passes(gate.thresholds())));
    }
}
