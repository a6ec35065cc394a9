#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keyword_cluster::pipeline::{EmbeddingError, EmbeddingProvider};
use keyword_cluster::{ClusteringParams, Record};

pub const MODEL_ID: &str = "vocab-test";

/// Every token the fixtures use gets its own axis.
pub const VOCABULARY: &[&str] = &[
    "budget", "planner", "template", "minimalist", "pastel", "monthly", "weekly", "student",
    "family", "couples", "freelancer", "paycheck", "debt", "savings", "holiday", "wedding",
    "checklist", "printable", "rustic", "boho", "elegant", "floral", "vintage", "modern",
    "beach", "garden", "winter", "summer", "classic", "simple", "quantum", "physics",
    "lecture", "aquarium", "filter", "sponge", "motorcycle", "helmet", "visor", "digital",
    "recipe", "card", "ceramic", "teapot",
];

pub const BUDGET_WORDS: [&str; 12] = [
    "minimalist", "pastel", "monthly", "weekly", "student", "family", "couples", "freelancer",
    "paycheck", "debt", "savings", "holiday",
];

pub const WEDDING_WORDS: [&str; 12] = [
    "rustic", "boho", "elegant", "floral", "vintage", "modern", "beach", "garden", "winter",
    "summer", "classic", "simple",
];

pub const OUTLIERS: [&str; 3] = [
    "Quantum Physics Lecture",
    "aquarium filter sponge",
    "Motorcycle helmet visor",
];

/// Bag-of-words embedder over [`VOCABULARY`]. Counts calls and embedded texts.
#[derive(Debug, Default)]
pub struct VocabEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

impl VocabEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn embedded_texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    fn vectorize(text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0; VOCABULARY.len()];
        for token in text.split_whitespace() {
            let axis = VOCABULARY
                .iter()
                .position(|word| *word == token)
                .ok_or_else(|| EmbeddingError::Model(format!("unknown token {token}")))?;
            vector[axis] += 1.0;
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for VocabEmbedder {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(batch.len(), Ordering::SeqCst);
        batch.iter().map(|text| Self::vectorize(text)).collect()
    }
}

/// Always answers 503.
#[derive(Debug, Default)]
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    async fn embed(&self, _batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Status {
            status: 503,
            body: "model loading".to_string(),
        })
    }
}

/// Sleeps before answering like [`VocabEmbedder`].
#[derive(Debug)]
pub struct SlowEmbedder {
    pub delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_id(&self) -> &str {
        MODEL_ID
    }

    fn dimension(&self) -> usize {
        VOCABULARY.len()
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::time::sleep(self.delay).await;
        batch.iter().map(|text| VocabEmbedder::vectorize(text)).collect()
    }
}

/// 12 budget planner templates, 12 wedding checklist printables, 3 unrelated phrases.
pub fn budget_and_wedding_records() -> Vec<Record> {
    let budget = BUDGET_WORDS
        .iter()
        .map(|word| format!("Budget Planner Template - {word}"));
    let wedding = WEDDING_WORDS
        .iter()
        .map(|word| format!("wedding checklist printable ({word})"));
    budget
        .chain(wedding)
        .chain(OUTLIERS.iter().map(|s| (*s).to_string()))
        .enumerate()
        .map(|(index, text)| Record::new(index as u64, text).with_popularity(index as f64 * 10.0))
        .collect()
}

/// Three topics of eight records, every record tagged "printable digital".
pub fn dual_text_records() -> Vec<Record> {
    let topics: [(&str, &[&str]); 3] = [
        ("budget planner", &BUDGET_WORDS[..8]),
        ("wedding checklist", &WEDDING_WORDS[..8]),
        (
            "recipe card",
            &["winter", "summer", "classic", "simple", "holiday", "paycheck", "debt", "savings"],
        ),
    ];
    topics
        .iter()
        .flat_map(|(topic, words)| {
            words
                .iter()
                .map(move |word| format!("{topic} printable digital {word}"))
        })
        .enumerate()
        .map(|(index, text)| Record::new(index as u64, text))
        .collect()
}

/// Two overlapping templates, a loose recipe group and one stray budget phrase.
///
/// Budget and wedding share "planner template" (cosine 0.5 between groups,
/// 0.75 within). Recipe records share a single token (cosine 0.5). The stray
/// phrase is farther from the budget records than the two templates are from
/// each other, so density clustering leaves it as noise.
pub fn merge_and_gate_records() -> Vec<Record> {
    let budget = BUDGET_WORDS[..8]
        .iter()
        .map(|word| format!("Budget Planner Template - {word}"));
    let wedding = WEDDING_WORDS[..8]
        .iter()
        .map(|word| format!("Wedding Planner Template ({word})"));
    let recipe = WEDDING_WORDS[8..]
        .iter()
        .chain(&BUDGET_WORDS[8..10])
        .map(|word| format!("Recipe {word}"));
    budget
        .chain(wedding)
        .chain(recipe)
        .chain(std::iter::once("Budget ceramic teapot".to_string()))
        .enumerate()
        .map(|(index, text)| Record::new(index as u64, text))
        .collect()
}

pub fn params() -> ClusteringParams {
    ClusteringParams {
        model_id: MODEL_ID.to_string(),
        min_cluster_size: 5,
        min_samples: 2,
        // With two or three pass-1 clusters every token would pass the
        // dispersion threshold on its own.
        min_attribute_clusters: 2,
        ..ClusteringParams::default()
    }
}
