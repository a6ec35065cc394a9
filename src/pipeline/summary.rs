//! Per-cluster summaries handed to downstream labeling.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::quality::ClusterQuality;
use super::types::{
    AssignmentSet, ClusterId, ClusterSummary, Keyword, Record, SizeTier, Stage, SummaryMetrics,
};
use crate::util::text::tokens;

/// How keywords are ranked inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeywordWeighting {
    /// Raw term frequency within the cluster.
    TermFrequency,
    /// Term frequency scaled by inverse cluster frequency.
    #[default]
    TfIcf,
}

impl FromStr for KeywordWeighting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tf" | "term_frequency" => Ok(Self::TermFrequency),
            "tf_icf" | "tficf" | "tf-icf" => Ok(Self::TfIcf),
            other => Err(format!("unknown keyword weighting: {other}")),
        }
    }
}

impl fmt::Display for KeywordWeighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TermFrequency => "term_frequency",
            Self::TfIcf => "tf_icf",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryOptions {
    pub representatives: usize,
    pub top_keywords: usize,
    pub weighting: KeywordWeighting,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            representatives: 10,
            top_keywords: 10,
            weighting: KeywordWeighting::TfIcf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterSummaryBuilder {
    options: SummaryOptions,
}

impl ClusterSummaryBuilder {
    #[must_use]
    pub fn new(options: SummaryOptions) -> Self {
        Self { options }
    }

    /// Builds one summary per cluster in `assignments`, largest first.
    ///
    /// `qualities` must be indexed by cluster number, as returned by the gate.
    #[must_use]
    pub fn build(
        &self,
        records: &[Record],
        normalized: &[String],
        assignments: &AssignmentSet,
        qualities: &[ClusterQuality],
    ) -> Vec<ClusterSummary> {
        let members = assignments.members();
        let term_counts: Vec<BTreeMap<&str, usize>> = members
            .iter()
            .map(|members| {
                let mut counts = BTreeMap::new();
                for &index in members {
                    for token in tokens(&normalized[index]) {
                        *counts.entry(token).or_insert(0) += 1;
                    }
                }
                counts
            })
            .collect();
        let keywords = rank_keywords(&term_counts, self.options.weighting, self.options.top_keywords);

        let mut summaries: Vec<ClusterSummary> = members
            .iter()
            .zip(keywords)
            .enumerate()
            .map(|(cluster, (members, top_keywords))| {
                let quality = qualities.get(cluster);
                ClusterSummary {
                    cluster_id: ClusterId(u32::try_from(cluster).unwrap_or(u32::MAX)),
                    size: members.len(),
                    top_keywords,
                    representative_phrases: representatives(
                        records,
                        members,
                        self.options.representatives,
                    ),
                    metrics: metrics(
                        records,
                        members,
                        assignments.stages(),
                        quality.map_or(1.0, |q| q.cohesion),
                        quality.map_or(1.0, |q| q.separation),
                    ),
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.size.cmp(&a.size).then(a.cluster_id.cmp(&b.cluster_id)));
        summaries
    }
}

fn popularity_of(record: &Record) -> Option<f64> {
    record.popularity.filter(|p| p.is_finite())
}

/// Ranks members by popularity (missing last) then by record id, returning
/// the first `limit` distinct raw texts.
fn representatives(records: &[Record], members: &[usize], limit: usize) -> Vec<String> {
    let mut ranked: Vec<&Record> = members.iter().map(|&index| &records[index]).collect();
    ranked.sort_by(|a, b| {
        let by_popularity = match (popularity_of(a), popularity_of(b)) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_popularity.then(a.id.cmp(&b.id))
    });

    let mut seen = FxHashSet::default();
    ranked
        .into_iter()
        .filter(|record| seen.insert(record.raw_text.as_str()))
        .take(limit)
        .map(|record| record.raw_text.clone())
        .collect()
}

fn metrics(
    records: &[Record],
    members: &[usize],
    stages: &[Stage],
    cohesion: f32,
    separation: f32,
) -> SummaryMetrics {
    let popularities: Vec<f64> = members
        .iter()
        .filter_map(|&index| popularity_of(&records[index]))
        .collect();
    let total_popularity: f64 = popularities.iter().sum();
    #[allow(clippy::cast_precision_loss)]
    let mean_popularity =
        (!popularities.is_empty()).then(|| total_popularity / popularities.len() as f64);

    SummaryMetrics {
        total_popularity,
        mean_popularity,
        merged_members: members
            .iter()
            .filter(|&&index| stages[index] == Stage::Merged)
            .count(),
        cohesion,
        separation,
        size_tier: SizeTier::of(members.len()),
    }
}

/// Ranks each cluster's terms and keeps the top `limit`.
///
/// TF-ICF uses `tf * (ln((1 + N) / (1 + cf)) + 1)` where `N` is the number of
/// clusters and `cf` the number of clusters containing the term. Ties are
/// broken alphabetically.
#[must_use]
pub fn rank_keywords(
    term_counts: &[BTreeMap<&str, usize>],
    weighting: KeywordWeighting,
    limit: usize,
) -> Vec<Vec<Keyword>> {
    let mut cluster_frequency: BTreeMap<&str, usize> = BTreeMap::new();
    for counts in term_counts {
        for token in counts.keys() {
            *cluster_frequency.entry(*token).or_insert(0) += 1;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let n_clusters = term_counts.len() as f64;

    term_counts
        .iter()
        .map(|counts| {
            let mut keywords: Vec<Keyword> = counts
                .iter()
                .map(|(token, &count)| {
                    #[allow(clippy::cast_precision_loss)]
                    let tf = count as f64;
                    let weight = match weighting {
                        KeywordWeighting::TermFrequency => tf,
                        KeywordWeighting::TfIcf => {
                            #[allow(clippy::cast_precision_loss)]
                            let cf = cluster_frequency.get(token).copied().unwrap_or(1) as f64;
                            tf * (((1.0 + n_clusters) / (1.0 + cf)).ln() + 1.0)
                        }
                    };
                    #[allow(clippy::cast_possible_truncation)]
                    let weight = weight as f32;
                    Keyword {
                        token: (*token).to_string(),
                        count,
                        weight,
                    }
                })
                .collect();
            keywords.sort_by(|a, b| b.weight.total_cmp(&a.weight).then(a.token.cmp(&b.token)));
            keywords.truncate(limit);
            keywords
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts<'a>(pairs: &[(&'a str, usize)]) -> BTreeMap<&'a str, usize> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn term_frequency_ranks_by_count_then_token() {
        let ranked = rank_keywords(
            &[counts(&[("planner", 3), ("budget", 3), ("monthly", 1)])],
            KeywordWeighting::TermFrequency,
            2,
        );
        let tokens: Vec<&str> = ranked[0].iter().map(|k| k.token.as_str()).collect();
        assert_eq!(tokens, vec!["budget", "planner"]);
    }

    #[test]
    fn tf_icf_penalizes_shared_terms() {
        let ranked = rank_keywords(
            &[
                counts(&[("printable", 4), ("budget", 3)]),
                counts(&[("printable", 4), ("wedding", 3)]),
                counts(&[("printable", 4), ("recipe", 3)]),
            ],
            KeywordWeighting::TfIcf,
            10,
        );
        assert_eq!(ranked[0][0].token, "budget");
        assert_eq!(ranked[1][0].token, "wedding");
        assert!(ranked[0][0].weight > ranked[0][1].weight);
    }

    #[test]
    fn representatives_order_by_popularity_then_id() {
        let records = vec![
            Record::new(3, "budget planner pastel").with_popularity(50.0),
            Record::new(1, "budget planner").with_popularity(120.0),
            Record::new(2, "budget planner minimalist"),
            Record::new(0, "budget planner weekly").with_popularity(50.0),
            Record::new(4, "budget planner").with_popularity(10.0),
        ];
        let phrases = representatives(&records, &[0, 1, 2, 3, 4], 10);
        assert_eq!(
            phrases,
            vec![
                "budget planner",
                "budget planner weekly",
                "budget planner pastel",
                "budget planner minimalist",
            ]
        );
        assert_eq!(representatives(&records, &[0, 1, 2, 3, 4], 2).len(), 2);
    }

    #[test]
    fn build_orders_summaries_by_size() {
        let records: Vec<Record> = [
            "wedding checklist",
            "budget planner",
            "budget tracker",
            "budget sheet",
            "wedding timeline",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| Record::new(i as u64, *text).with_popularity(1.0))
        .collect();
        let normalized: Vec<String> = records.iter().map(|r| r.raw_text.clone()).collect();
        let labels = AssignmentSet::from_density_labels(vec![Some(0), Some(1), Some(1), Some(1), None])
            .with_merged(&[(4, 0)]);
        let qualities = vec![
            ClusterQuality {
                cluster: 0,
                size: 2,
                cohesion: 0.6,
                separation: 0.9,
            },
            ClusterQuality {
                cluster: 1,
                size: 3,
                cohesion: 0.8,
                separation: 0.9,
            },
        ];

        let summaries =
            ClusterSummaryBuilder::default().build(&records, &normalized, &labels, &qualities);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].cluster_id, ClusterId(1));
        assert_eq!(summaries[0].top_keywords[0].token, "budget");
        assert_eq!(summaries[0].top_keywords[0].count, 3);
        assert_eq!(summaries[1].metrics.merged_members, 1);
        assert!((summaries[1].metrics.total_popularity - 2.0).abs() < f64::EPSILON);
        assert_eq!(summaries[1].metrics.mean_popularity, Some(1.0));
        assert_eq!(summaries[1].metrics.size_tier, SizeTier::Micro);
        assert!((summaries[0].metrics.cohesion - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn weighting_parses_aliases() {
        assert_eq!("tf".parse::<KeywordWeighting>(), Ok(KeywordWeighting::TermFrequency));
        assert_eq!("TF-ICF".parse::<KeywordWeighting>(), Ok(KeywordWeighting::TfIcf));
        assert!("bm25".parse::<KeywordWeighting>().is_err());
    }
}
