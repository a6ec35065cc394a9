//! Second clustering pass on topic text.
//!
//! Topic text is the normalized text with every attribute word removed. The
//! topic texts are embedded and clustered again, and that result replaces pass 1
//! entirely.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::{info, warn};

use super::cache::CacheStats;
use super::density::DensityParams;
use super::orchestrator::StageContext;
use super::types::{AssignmentSet, AttributeWord};
use crate::error::PipelineError;
use crate::util::text::tokens;

/// Output of the topic-text pass.
#[derive(Debug, Clone)]
pub struct DualTextOutcome {
    pub topic_texts: Vec<String>,
    /// Unit-length topic-text vectors, positionally aligned with the input.
    pub vectors: Arc<Vec<Vec<f32>>>,
    pub assignments: AssignmentSet,
    pub cache: CacheStats,
    /// Records whose topic text came out empty and fell back to the normalized text.
    pub fallbacks: usize,
}

/// Removes attribute words from every normalized text.
///
/// A text left empty falls back to its normalized form, so every record keeps
/// a non-empty input for the second embedding pass. Returns the texts and the
/// number of fallbacks.
#[must_use]
pub fn topic_texts(normalized: &[String], attribute_words: &[AttributeWord]) -> (Vec<String>, usize) {
    let attributes: FxHashSet<&str> = attribute_words.iter().map(|w| w.token.as_str()).collect();
    let mut fallbacks = 0;
    let texts = normalized
        .iter()
        .map(|text| {
            let topic = tokens(text)
                .filter(|token| !attributes.contains(token))
                .collect::<Vec<_>>()
                .join(" ");
            if topic.is_empty() {
                fallbacks += 1;
                text.clone()
            } else {
                topic
            }
        })
        .collect();
    (texts, fallbacks)
}

#[derive(Debug, Clone, Copy)]
pub struct DualTextClusterer {
    params: DensityParams,
}

impl DualTextClusterer {
    #[must_use]
    pub fn new(params: DensityParams) -> Self {
        Self { params }
    }

    pub(crate) async fn run(
        &self,
        ctx: &StageContext<'_>,
        normalized: &[String],
        attribute_words: &[AttributeWord],
    ) -> Result<DualTextOutcome, PipelineError> {
        let (topic_texts, fallbacks) = topic_texts(normalized, attribute_words);
        if fallbacks > 0 {
            warn!(
                fallbacks,
                "topic text empty after attribute removal, using normalized text"
            );
        }

        let (vectors, cache) = ctx.embed(&topic_texts).await?;
        let vectors = Arc::new(vectors);
        let assignments = ctx.cluster(self.params, Arc::clone(&vectors)).await?;

        info!(
            attribute_words = attribute_words.len(),
            clusters = assignments.n_clusters(),
            noise = assignments.noise_count(),
            "topic-text pass finished"
        );

        Ok(DualTextOutcome {
            topic_texts,
            vectors,
            assignments,
            cache,
            fallbacks,
        })
    }
}
