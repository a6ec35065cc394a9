//! Runs the stages of one clustering run in order.
//!
//! ```text
//! Ingested -> Embedded -> Pass1Clustered -> [AttributeDiscovered -> [Pass2Clustered]]
//!          -> Merged -> QualityGated -> Summarized
//! ```
//!
//! A run with fewer records than `min_cluster_size` goes straight from
//! `Ingested` to `Summarized` with an all-noise result. Cancellation is checked
//! after every transition and raced against embedding and clustering work.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::attribute::AttributeWordDiscovery;
use super::cache::{CacheStats, EmbeddingCache};
use super::density::{DensityClusterer, DensityParams};
use super::dual_text::DualTextClusterer;
use super::embedding::build_provider;
use super::merge::NoiseMergeStrategy;
use super::normalize::TextNormalizer;
use super::quality::ClusterQualityGate;
use super::summary::ClusterSummaryBuilder;
use super::types::{
    AssignmentSet, Cluster, ClusterAssignment, ClusterId, ClusteringResult, Record, RunStats,
    SizeDistribution, StageCounts,
};
use crate::config::{ClusteringParams, PipelineConfig};
use crate::error::PipelineError;
use crate::observability::metrics::Metrics;
use crate::util::vector::l2_normalized;

/// Last stage a run completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Ingested,
    Embedded,
    Pass1Clustered,
    AttributeDiscovered,
    Pass2Clustered,
    Merged,
    QualityGated,
    Summarized,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingested => "ingested",
            Self::Embedded => "embedded",
            Self::Pass1Clustered => "pass1_clustered",
            Self::AttributeDiscovered => "attribute_discovered",
            Self::Pass2Clustered => "pass2_clustered",
            Self::Merged => "merged",
            Self::QualityGated => "quality_gated",
            Self::Summarized => "summarized",
        }
    }

    /// Whether `next` may directly follow `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Ingested, Self::Embedded | Self::Summarized)
                | (Self::Embedded, Self::Pass1Clustered)
                | (Self::Pass1Clustered, Self::AttributeDiscovered | Self::Merged)
                | (Self::AttributeDiscovered, Self::Pass2Clustered | Self::Merged)
                | (Self::Pass2Clustered, Self::Merged)
                | (Self::Merged, Self::QualityGated)
                | (Self::QualityGated, Self::Summarized)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Summarized
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-stage time limits. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineOptions {
    /// Applies to each embedding stage separately.
    pub embedding_timeout: Option<Duration>,
    /// Applies to each density, merge and quality-gate computation separately.
    pub clustering_timeout: Option<Duration>,
}

/// Per-run state shared by the stages: cancellation, timeouts, state tracking
/// and access to the embedding cache.
pub(crate) struct StageContext<'a> {
    run_id: Uuid,
    cache: &'a EmbeddingCache,
    model_id: &'a str,
    options: PipelineOptions,
    cancel: &'a CancellationToken,
    metrics: Option<&'a Metrics>,
    state: RunState,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        run_id: Uuid,
        cache: &'a EmbeddingCache,
        model_id: &'a str,
        options: PipelineOptions,
        cancel: &'a CancellationToken,
        metrics: Option<&'a Metrics>,
    ) -> Self {
        Self {
            run_id,
            cache,
            model_id,
            options,
            cancel,
            metrics,
            state: RunState::Ingested,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    /// Records a completed stage, then checks for cancellation.
    pub(crate) fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_advance_to(next) {
            return Err(PipelineError::Worker(format!(
                "invalid stage transition {} -> {next}",
                self.state
            )));
        }
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "stage transition");
        self.state = next;
        self.checkpoint()
    }

    pub(crate) fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: self.state });
        }
        Ok(())
    }

    /// Runs `work` under the optional timeout, abandoning it as soon as the
    /// run is cancelled.
    async fn guard<T, F>(&self, timeout: Option<Duration>, work: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let stage = self.state;
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, work)
                    .await
                    .map_err(|_| PipelineError::TimedOut {
                        stage,
                        timeout: limit,
                    })?,
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(PipelineError::Cancelled { stage }),
            result = bounded => result,
        }
    }

    /// Embeds `texts` through the cache and returns unit-length vectors.
    pub(crate) async fn embed(
        &self,
        texts: &[String],
    ) -> Result<(Vec<Vec<f32>>, CacheStats), PipelineError> {
        let started = Instant::now();
        let (vectors, stats) = self
            .guard(self.options.embedding_timeout, async {
                self.cache
                    .get_or_compute(texts, self.model_id)
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;
        if let Some(metrics) = self.metrics {
            metrics.embedding_duration.observe(started.elapsed().as_secs_f64());
        }
        info!(
            run_id = %self.run_id,
            texts = texts.len(),
            hits = stats.hits,
            computed = stats.computed,
            "embedding stage finished"
        );
        Ok((vectors.iter().map(|v| l2_normalized(v)).collect(), stats))
    }

    /// Runs CPU-bound work on the blocking pool under the clustering timeout.
    pub(crate) async fn blocking<T, F>(&self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.guard(self.options.clustering_timeout, async {
            tokio::task::spawn_blocking(work)
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))
        })
        .await
    }

    /// One density pass over `vectors`.
    pub(crate) async fn cluster(
        &self,
        params: DensityParams,
        vectors: Arc<Vec<Vec<f32>>>,
    ) -> Result<AssignmentSet, PipelineError> {
        let started = Instant::now();
        let clusterer = DensityClusterer::new(params);
        let labels = self.blocking(move || clusterer.cluster(&vectors)).await?;
        if let Some(metrics) = self.metrics {
            metrics.clustering_duration.observe(started.elapsed().as_secs_f64());
        }
        let assignments = AssignmentSet::from_density_labels(labels);
        info!(
            run_id = %self.run_id,
            policy = %params.policy,
            clusters = assignments.n_clusters(),
            noise = assignments.noise_count(),
            "density pass finished"
        );
        Ok(assignments)
    }
}

/// Entry point. Holds the embedding cache across runs so later runs reuse
/// earlier vectors.
#[derive(Debug, Clone)]
pub struct ClusteringPipeline {
    cache: Arc<EmbeddingCache>,
    normalizer: TextNormalizer,
    options: PipelineOptions,
    metrics: Option<Arc<Metrics>>,
}

impl ClusteringPipeline {
    #[must_use]
    pub fn new(cache: Arc<EmbeddingCache>) -> Self {
        Self {
            cache,
            normalizer: TextNormalizer::new(),
            options: PipelineOptions::default(),
            metrics: None,
        }
    }

    /// Builds the provider and an in-memory cache from `config`.
    ///
    /// # Errors
    /// Returns [`PipelineError::EmbeddingUnavailable`] when the provider cannot be constructed.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let provider = build_provider(config.provider())?;
        let cache = EmbeddingCache::in_memory(provider).with_batching(
            config.provider().batch_size,
            config.provider().max_concurrency,
        );
        Ok(Self::new(Arc::new(cache)).with_options(*config.options()))
    }

    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Clusters `records` without external cancellation.
    ///
    /// # Errors
    /// See [`ClusteringPipeline::run_with_cancellation`].
    pub async fn run(
        &self,
        records: &[Record],
        params: &ClusteringParams,
    ) -> Result<ClusteringResult, PipelineError> {
        self.run_with_cancellation(records, params, &CancellationToken::new())
            .await
    }

    /// Clusters `records`, returning a complete result or a single error.
    ///
    /// # Errors
    /// - [`PipelineError::InvalidParameters`] before any work when `params` is inconsistent
    /// - [`PipelineError::EmbeddingUnavailable`] when the provider fails
    /// - [`PipelineError::Cancelled`] / [`PipelineError::TimedOut`] with the last completed stage
    /// - [`PipelineError::Worker`] when a clustering task panics
    pub async fn run_with_cancellation(
        &self,
        records: &[Record],
        params: &ClusteringParams,
        cancel: &CancellationToken,
    ) -> Result<ClusteringResult, PipelineError> {
        let run_id = Uuid::now_v7();
        let span = info_span!("clustering_run", %run_id, records = records.len());
        let started = Instant::now();

        let result = self
            .execute(run_id, records, params, cancel)
            .instrument(span)
            .await;

        match &result {
            Ok(output) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_run(output, started.elapsed());
                }
            }
            Err(error) => {
                warn!(%run_id, error = %error, "clustering run failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(error);
                }
            }
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(
        &self,
        run_id: Uuid,
        records: &[Record],
        params: &ClusteringParams,
        cancel: &CancellationToken,
    ) -> Result<ClusteringResult, PipelineError> {
        let started_at = Utc::now();
        params.validate()?;
        if params.model_id != self.cache.model_id() {
            return Err(PipelineError::InvalidParameters(format!(
                "model_id {} does not match provider model {}",
                params.model_id,
                self.cache.model_id()
            )));
        }
        if self.cache.dimension() == 0 {
            return Err(PipelineError::InvalidParameters(
                "embedding provider reports dimension 0".to_string(),
            ));
        }

        let mut ctx = StageContext::new(
            run_id,
            &self.cache,
            &params.model_id,
            self.options,
            cancel,
            self.metrics.as_deref(),
        );
        ctx.checkpoint()?;

        info!(
            records = records.len(),
            model = %params.model_id,
            dual_text = params.use_dual_text,
            "clustering run started"
        );

        if records.len() < params.min_cluster_size {
            warn!(
                records = records.len(),
                min_cluster_size = params.min_cluster_size,
                "insufficient data, every record is noise"
            );
            ctx.advance(RunState::Summarized)?;
            return Ok(insufficient_result(run_id, started_at, records));
        }

        let normalized = self.normalizer.normalize_records(records);

        let (vectors, mut cache_stats) = ctx.embed(&normalized).await?;
        ctx.advance(RunState::Embedded)?;

        let mut vectors = Arc::new(vectors);
        let mut assignments = ctx.cluster(params.density(), Arc::clone(&vectors)).await?;
        ctx.advance(RunState::Pass1Clustered)?;
        let pass1_clusters = assignments.n_clusters();
        let pass1_noise = assignments.noise_count();

        let mut attribute_words = Vec::new();
        let mut pass2_ran = false;
        if params.use_dual_text {
            attribute_words =
                AttributeWordDiscovery::new(params.dispersion_threshold, params.min_attribute_clusters)
                    .discover(&normalized, &assignments);
            info!(
                attribute_words = attribute_words.len(),
                "attribute word discovery finished"
            );
            ctx.advance(RunState::AttributeDiscovered)?;

            if attribute_words.is_empty() {
                debug!("no attribute words, keeping pass-1 clusters");
            } else {
                let outcome = DualTextClusterer::new(params.pass2_density())
                    .run(&ctx, &normalized, &attribute_words)
                    .await?;
                cache_stats = cache_stats.combined(outcome.cache);
                vectors = outcome.vectors;
                assignments = outcome.assignments;
                pass2_ran = true;
                ctx.advance(RunState::Pass2Clustered)?;
            }
        }

        let merger = NoiseMergeStrategy::new(params.merge_threshold);
        let merged = {
            let vectors = Arc::clone(&vectors);
            let before = assignments.clone();
            ctx.blocking(move || merger.merge(&vectors, &before)).await?
        };
        let merged_records = assignments.noise_count() - merged.noise_count();
        info!(
            merged = merged_records,
            noise = merged.noise_count(),
            "noise merge finished"
        );
        ctx.advance(RunState::Merged)?;

        let gate = ClusterQualityGate::new(params.quality_thresholds());
        let gated = {
            let vectors = Arc::clone(&vectors);
            ctx.blocking(move || gate.apply(&vectors, &merged)).await?
        };
        ctx.advance(RunState::QualityGated)?;

        let final_set = &gated.assignments;
        let summaries = ClusterSummaryBuilder::new(params.summary).build(
            records,
            &normalized,
            final_set,
            &gated.qualities,
        );

        let clusters: Vec<Cluster> = final_set
            .members()
            .into_iter()
            .zip(gated.centroids)
            .zip(&gated.qualities)
            .enumerate()
            .map(|(index, ((members, centroid), quality))| Cluster {
                cluster_id: cluster_id(index),
                size: members.len(),
                members: members.iter().map(|&i| records[i].id).collect(),
                centroid,
                cohesion: quality.cohesion,
                separation: quality.separation,
            })
            .collect();

        let assignments_out = build_assignments(records, final_set);
        let sizes: Vec<usize> = clusters.iter().map(|c| c.size).collect();
        let n_noise = final_set.noise_count();
        let stats = RunStats {
            n_records: records.len(),
            n_clusters: clusters.len(),
            n_noise,
            noise_ratio: ratio(n_noise, records.len()),
            per_stage_counts: StageCounts::from_stages(final_set.stages()),
            pass1_clusters,
            pass1_noise,
            pass2_ran,
            merged_records,
            demoted_clusters: gated.demoted,
            size_distribution: SizeDistribution::from_sizes(&sizes),
            cache: cache_stats,
            insufficient_data: false,
        };

        ctx.advance(RunState::Summarized)?;
        if stats.n_clusters == 0 {
            warn!(records = records.len(), "run produced no clusters");
        }
        info!(
            state = %ctx.state(),
            clusters = stats.n_clusters,
            noise = stats.n_noise,
            noise_ratio = stats.noise_ratio,
            demoted = stats.demoted_clusters,
            "clustering run finished"
        );

        Ok(ClusteringResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            clusters,
            assignments: assignments_out,
            summaries,
            attribute_words,
            stats,
        })
    }
}

fn cluster_id(index: usize) -> ClusterId {
    ClusterId(u32::try_from(index).unwrap_or(u32::MAX))
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn build_assignments(records: &[Record], set: &AssignmentSet) -> Vec<ClusterAssignment> {
    records
        .iter()
        .zip(set.labels().iter().zip(set.stages()))
        .map(|(record, (label, stage))| ClusterAssignment {
            record_id: record.id,
            cluster_id: label.map(cluster_id),
            stage: *stage,
        })
        .collect()
}

fn insufficient_result(
    run_id: Uuid,
    started_at: chrono::DateTime<Utc>,
    records: &[Record],
) -> ClusteringResult {
    let set = AssignmentSet::all_noise(records.len());
    ClusteringResult {
        run_id,
        started_at,
        finished_at: Utc::now(),
        clusters: Vec::new(),
        assignments: build_assignments(records, &set),
        summaries: Vec::new(),
        attribute_words: Vec::new(),
        stats: RunStats {
            n_records: records.len(),
            n_noise: records.len(),
            noise_ratio: ratio(records.len(), records.len()),
            per_stage_counts: StageCounts::from_stages(set.stages()),
            insufficient_data: true,
            ..RunStats::default()
        },
    }
}
