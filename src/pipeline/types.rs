//! Data model shared by every clustering stage.
//!
//! Records are owned by the caller. Everything else here is produced by a
//! single run and carries no meaning across runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cache::CacheStats;

/// Caller-assigned record identifier. Also the tiebreak for ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A short input text such as a product name or search phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub raw_text: String,
    /// Popularity metric (search volume, review count, ...). Used for ranking only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity: Option<f64>,
}

impl Record {
    pub fn new(id: u64, raw_text: impl Into<String>) -> Self {
        Self {
            id: RecordId(id),
            raw_text: raw_text.into(),
            popularity: None,
        }
    }

    #[must_use]
    pub fn with_popularity(mut self, popularity: f64) -> Self {
        self.popularity = Some(popularity);
        self
    }
}

/// Contiguous cluster number within one run (`0..n_clusters`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a record ended up where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Assigned directly by density clustering.
    Primary,
    /// Noise point attached to a centroid by the merge step.
    Merged,
    /// Not part of any cluster.
    #[default]
    Noise,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Merged => "merged",
            Self::Noise => "noise",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final placement of one record. `cluster_id == None` means noise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub record_id: RecordId,
    pub cluster_id: Option<ClusterId>,
    pub stage: Stage,
}

impl ClusterAssignment {
    #[must_use]
    pub fn is_noise(&self) -> bool {
        self.cluster_id.is_none()
    }
}

/// Positional labels for one stage of a run.
///
/// Each stage produces a fresh set; earlier sets are never mutated. Cluster
/// labels are always contiguous (`0..n_clusters`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentSet {
    labels: Vec<Option<usize>>,
    stages: Vec<Stage>,
    n_clusters: usize,
}

impl AssignmentSet {
    /// Builds the set produced by a density pass. Labels must already be contiguous.
    #[must_use]
    pub fn from_density_labels(labels: Vec<Option<usize>>) -> Self {
        let n_clusters = labels.iter().flatten().max().map_or(0, |max| max + 1);
        let stages = labels
            .iter()
            .map(|label| if label.is_some() { Stage::Primary } else { Stage::Noise })
            .collect();
        Self {
            labels,
            stages,
            n_clusters,
        }
    }

    /// Every record is noise.
    #[must_use]
    pub fn all_noise(len: usize) -> Self {
        Self {
            labels: vec![None; len],
            stages: vec![Stage::Noise; len],
            n_clusters: 0,
        }
    }

    #[must_use]
    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[must_use]
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    #[must_use]
    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|label| label.is_none()).count()
    }

    /// Indices of noise records in input order.
    #[must_use]
    pub fn noise_indices(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(index, label)| label.is_none().then_some(index))
            .collect()
    }

    /// Record indices of each cluster, ascending.
    #[must_use]
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_clusters];
        for (index, label) in self.labels.iter().enumerate() {
            if let Some(cluster) = label {
                members[*cluster].push(index);
            }
        }
        members
    }

    /// Returns a new set where each `(record_index, cluster)` pair is attached
    /// to an existing cluster with stage [`Stage::Merged`].
    #[must_use]
    pub fn with_merged(&self, reassignments: &[(usize, usize)]) -> Self {
        let mut next = self.clone();
        for &(index, cluster) in reassignments {
            debug_assert!(cluster < self.n_clusters);
            next.labels[index] = Some(cluster);
            next.stages[index] = Stage::Merged;
        }
        next
    }

    /// Returns a new set with the given clusters dissolved into noise and the
    /// surviving clusters renumbered in their original order.
    #[must_use]
    pub fn with_demoted(&self, demoted: &[usize]) -> Self {
        let mut remap = vec![None; self.n_clusters];
        let mut next_id = 0;
        for (cluster, slot) in remap.iter_mut().enumerate() {
            if !demoted.contains(&cluster) {
                *slot = Some(next_id);
                next_id += 1;
            }
        }

        let mut labels = Vec::with_capacity(self.labels.len());
        let mut stages = Vec::with_capacity(self.stages.len());
        for (label, stage) in self.labels.iter().zip(&self.stages) {
            match label.and_then(|cluster| remap[cluster]) {
                Some(cluster) => {
                    labels.push(Some(cluster));
                    stages.push(*stage);
                }
                None => {
                    labels.push(None);
                    stages.push(Stage::Noise);
                }
            }
        }

        Self {
            labels,
            stages,
            n_clusters: next_id,
        }
    }
}

/// A finalized cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    pub members: Vec<RecordId>,
    /// Mean of the members' unit vectors.
    pub centroid: Vec<f32>,
    pub size: usize,
    pub cohesion: f32,
    pub separation: f32,
}

/// Token spread over many unrelated clusters (format, material, style...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeWord {
    pub token: String,
    pub dispersion: f32,
    pub cluster_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub token: String,
    pub count: usize,
    pub weight: f32,
}

/// Size bucket of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    /// 10 members or more.
    Primary,
    /// 5 to 9 members.
    Secondary,
    /// Fewer than 5 members.
    Micro,
}

impl SizeTier {
    #[must_use]
    pub fn of(size: usize) -> Self {
        match size {
            10.. => Self::Primary,
            5..=9 => Self::Secondary,
            _ => Self::Micro,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub total_popularity: f64,
    /// Mean over members that carry a popularity value.
    pub mean_popularity: Option<f64>,
    pub merged_members: usize,
    pub cohesion: f32,
    pub separation: f32,
    pub size_tier: SizeTier,
}

/// Statistics handed to external labeling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: ClusterId,
    pub size: usize,
    pub top_keywords: Vec<Keyword>,
    pub representative_phrases: Vec<String>,
    pub metrics: SummaryMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCounts {
    pub primary: usize,
    pub merged: usize,
    pub noise: usize,
}

impl StageCounts {
    #[must_use]
    pub fn from_stages(stages: &[Stage]) -> Self {
        stages.iter().fold(Self::default(), |mut counts, stage| {
            match stage {
                Stage::Primary => counts.primary += 1,
                Stage::Merged => counts.merged += 1,
                Stage::Noise => counts.noise += 1,
            }
            counts
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SizeDistribution {
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    pub primary: usize,
    pub secondary: usize,
    pub micro: usize,
}

impl SizeDistribution {
    #[must_use]
    pub fn from_sizes(sizes: &[usize]) -> Self {
        if sizes.is_empty() {
            return Self::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;
        let mut distribution = Self {
            min: sizes.iter().copied().min().unwrap_or(0),
            max: sizes.iter().copied().max().unwrap_or(0),
            mean,
            ..Self::default()
        };
        for &size in sizes {
            match SizeTier::of(size) {
                SizeTier::Primary => distribution.primary += 1,
                SizeTier::Secondary => distribution.secondary += 1,
                SizeTier::Micro => distribution.micro += 1,
            }
        }
        distribution
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub n_records: usize,
    pub n_clusters: usize,
    pub n_noise: usize,
    pub noise_ratio: f64,
    pub per_stage_counts: StageCounts,
    pub pass1_clusters: usize,
    pub pass1_noise: usize,
    pub pass2_ran: bool,
    pub merged_records: usize,
    pub demoted_clusters: usize,
    pub size_distribution: SizeDistribution,
    pub cache: CacheStats,
    /// Fewer records than `min_cluster_size`; everything is noise.
    pub insufficient_data: bool,
}

/// Everything a run produces. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub clusters: Vec<Cluster>,
    pub assignments: Vec<ClusterAssignment>,
    pub summaries: Vec<ClusterSummary>,
    pub attribute_words: Vec<AttributeWord>,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_labels_mark_primary_and_noise() {
        let set = AssignmentSet::from_density_labels(vec![Some(0), None, Some(1), Some(0)]);
        assert_eq!(set.n_clusters(), 2);
        assert_eq!(set.noise_count(), 1);
        assert_eq!(
            set.stages(),
            &[Stage::Primary, Stage::Noise, Stage::Primary, Stage::Primary]
        );
        assert_eq!(set.members(), vec![vec![0, 3], vec![2]]);
    }

    #[test]
    fn with_merged_leaves_original_untouched() {
        let set = AssignmentSet::from_density_labels(vec![Some(0), None, None]);
        let merged = set.with_merged(&[(2, 0)]);

        assert_eq!(set.labels(), &[Some(0), None, None]);
        assert_eq!(merged.labels(), &[Some(0), None, Some(0)]);
        assert_eq!(merged.stages()[2], Stage::Merged);
        assert_eq!(merged.noise_indices(), vec![1]);
    }

    #[test]
    fn with_demoted_renumbers_survivors() {
        let set = AssignmentSet::from_density_labels(vec![Some(0), Some(1), Some(2), Some(1)])
            .with_merged(&[]);
        let demoted = set.with_demoted(&[1]);

        assert_eq!(demoted.labels(), &[Some(0), None, Some(1), None]);
        assert_eq!(demoted.stages()[1], Stage::Noise);
        assert_eq!(demoted.n_clusters(), 2);
    }

    #[test]
    fn size_tiers_follow_bucket_boundaries() {
        assert_eq!(SizeTier::of(10), SizeTier::Primary);
        assert_eq!(SizeTier::of(9), SizeTier::Secondary);
        assert_eq!(SizeTier::of(5), SizeTier::Secondary);
        assert_eq!(SizeTier::of(4), SizeTier::Micro);
    }

    #[test]
    fn size_distribution_of_empty_is_zeroed() {
        assert_eq!(SizeDistribution::from_sizes(&[]), SizeDistribution::default());
        let distribution = SizeDistribution::from_sizes(&[12, 6, 3]);
        assert_eq!(distribution.min, 3);
        assert_eq!(distribution.max, 12);
        assert_eq!(
            (distribution.primary, distribution.secondary, distribution.micro),
            (1, 1, 1)
        );
    }
}
