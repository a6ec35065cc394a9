//! Attribute-word discovery.
//!
//! Words such as "printable", "digital" or "editable" describe a format or
//! style rather than a topic. They show up in many unrelated pass-1 clusters
//! and pull semantically different records together. A token's dispersion is
//! the share of non-noise clusters whose members contain it at least once.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use super::normalize::is_stopword;
use super::types::{AssignmentSet, AttributeWord};
use crate::util::text::tokens;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributeWordDiscovery {
    dispersion_threshold: f32,
    min_clusters: usize,
}

impl Default for AttributeWordDiscovery {
    fn default() -> Self {
        Self::new(0.3, 1)
    }
}

impl AttributeWordDiscovery {
    /// `dispersion_threshold` is inclusive. `min_clusters` is the minimum
    /// number of distinct clusters a token must appear in; 1 leaves dispersion
    /// as the only test.
    #[must_use]
    pub fn new(dispersion_threshold: f32, min_clusters: usize) -> Self {
        Self {
            dispersion_threshold,
            min_clusters: min_clusters.max(1),
        }
    }

    /// Returns attribute words sorted by token.
    ///
    /// # Arguments
    /// * `normalized` - normalized text per record, positionally aligned with `assignments`
    /// * `assignments` - pass-1 labels
    #[must_use]
    pub fn discover(&self, normalized: &[String], assignments: &AssignmentSet) -> Vec<AttributeWord> {
        let n_clusters = assignments.n_clusters();
        if n_clusters == 0 {
            return Vec::new();
        }

        let mut cluster_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for members in assignments.members() {
            let vocabulary: FxHashSet<&str> = members
                .iter()
                .flat_map(|&index| tokens(&normalized[index]))
                .collect();
            for token in vocabulary {
                *cluster_counts.entry(token).or_insert(0) += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let total = n_clusters as f32;
        cluster_counts
            .into_iter()
            .filter_map(|(token, count)| {
                #[allow(clippy::cast_precision_loss)]
                let dispersion = count as f32 / total;
                (count >= self.min_clusters
                    && dispersion >= self.dispersion_threshold
                    && !is_stopword(token))
                .then(|| AttributeWord {
                    token: token.to_string(),
                    dispersion,
                    cluster_count: count,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn shared_modifiers_are_attribute_words() {
        let normalized = texts(&[
            "budget planner printable",
            "budget tracker printable",
            "wedding checklist printable",
            "wedding timeline",
            "recipe card printable digital",
            "recipe binder digital",
        ]);
        let labels = AssignmentSet::from_density_labels(vec![
            Some(0),
            Some(0),
            Some(1),
            Some(1),
            Some(2),
            Some(2),
        ]);

        let words = AttributeWordDiscovery::new(0.5, 2).discover(&normalized, &labels);

        assert_eq!(words.len(), 1);
        assert_eq!(words[0].token, "printable");
        assert_eq!(words[0].cluster_count, 3);
        assert!((words[0].dispersion - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn threshold_is_inclusive() {
        let normalized = texts(&["gift mug", "gift card", "candle", "poster"]);
        let labels =
            AssignmentSet::from_density_labels(vec![Some(0), Some(1), Some(2), Some(3)]);

        let words = AttributeWordDiscovery::new(0.5, 2).discover(&normalized, &labels);

        assert_eq!(words.len(), 1);
        assert_eq!(words[0].token, "gift");
        assert!((words[0].dispersion - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn default_rule_uses_dispersion_alone() {
        let normalized = texts(&["budget planner", "wedding checklist", "recipe card"]);
        let labels = AssignmentSet::from_density_labels(vec![Some(0), Some(1), Some(2)]);

        let words = AttributeWordDiscovery::default().discover(&normalized, &labels);

        let tokens: Vec<&str> = words.iter().map(|w| w.token.as_str()).collect();
        assert_eq!(
            tokens,
            vec!["budget", "card", "checklist", "planner", "recipe", "wedding"]
        );
        assert!(words.iter().all(|w| w.cluster_count == 1));
        assert!(words.iter().all(|w| (w.dispersion - 1.0 / 3.0).abs() < 1e-6));
    }

    #[test]
    fn min_clusters_drops_tokens_confined_to_one_cluster() {
        let normalized = texts(&["budget planner", "wedding checklist", "recipe card"]);
        let labels = AssignmentSet::from_density_labels(vec![Some(0), Some(1), Some(2)]);

        let words = AttributeWordDiscovery::new(0.3, 2).discover(&normalized, &labels);

        assert!(words.is_empty());
    }

    #[test]
    fn noise_records_do_not_count() {
        let normalized = texts(&["printable planner", "printable checklist", "printable"]);
        let labels = AssignmentSet::from_density_labels(vec![Some(0), None, None]);

        let words = AttributeWordDiscovery::new(0.3, 1).discover(&normalized, &labels);

        let tokens: Vec<&str> = words.iter().map(|w| w.token.as_str()).collect();
        assert_eq!(tokens, vec!["planner", "printable"]);
    }

    #[test]
    fn no_clusters_means_no_attribute_words() {
        let normalized = texts(&["a", "b"]);
        let labels = AssignmentSet::all_noise(2);
        assert!(AttributeWordDiscovery::default().discover(&normalized, &labels).is_empty());
    }
}
