/// Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, Registry, register_counter_vec_with_registry,
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::pipeline::types::ClusteringResult;
use crate::util::error::classify_error;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub runs_completed: Counter,
    pub runs_failed: CounterVec,
    pub clusters_created: Counter,
    pub noise_records: Counter,
    pub merged_records: Counter,
    pub demoted_clusters: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,

    // ヒストグラム
    pub embedding_duration: Histogram,
    pub clustering_duration: Histogram,
    pub run_duration: Histogram,

    // ゲージ
    pub last_noise_ratio: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスが既にレジストリに登録されている場合はエラーを返す。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            runs_completed: register_counter_with_registry!(
                "keyword_cluster_runs_completed_total",
                "Total number of clustering runs completed",
                registry
            )?,
            runs_failed: register_counter_vec_with_registry!(
                "keyword_cluster_runs_failed_total",
                "Total number of clustering runs failed, by error kind",
                &["kind"],
                registry
            )?,
            clusters_created: register_counter_with_registry!(
                "keyword_cluster_clusters_created_total",
                "Total number of clusters in finished results",
                registry
            )?,
            noise_records: register_counter_with_registry!(
                "keyword_cluster_noise_records_total",
                "Total number of records left as noise",
                registry
            )?,
            merged_records: register_counter_with_registry!(
                "keyword_cluster_merged_records_total",
                "Total number of noise records merged into a cluster",
                registry
            )?,
            demoted_clusters: register_counter_with_registry!(
                "keyword_cluster_demoted_clusters_total",
                "Total number of clusters dissolved by the quality gate",
                registry
            )?,
            cache_hits: register_counter_with_registry!(
                "keyword_cluster_embedding_cache_hits_total",
                "Embedding lookups served from the cache",
                registry
            )?,
            cache_misses: register_counter_with_registry!(
                "keyword_cluster_embedding_cache_misses_total",
                "Embedding lookups that required the provider",
                registry
            )?,
            embedding_duration: register_histogram_with_registry!(
                "keyword_cluster_embedding_duration_seconds",
                "Duration of embedding stages",
                registry
            )?,
            clustering_duration: register_histogram_with_registry!(
                "keyword_cluster_clustering_duration_seconds",
                "Duration of density clustering passes",
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                "keyword_cluster_run_duration_seconds",
                "Duration of complete clustering runs",
                registry
            )?,
            last_noise_ratio: register_gauge_with_registry!(
                "keyword_cluster_last_noise_ratio",
                "Noise ratio of the most recent completed run",
                registry
            )?,
        })
    }

    /// 完了した実行の結果を記録する。
    #[allow(clippy::cast_precision_loss)]
    pub fn record_run(&self, result: &ClusteringResult, elapsed: Duration) {
        let stats = &result.stats;
        self.runs_completed.inc();
        self.clusters_created.inc_by(stats.n_clusters as f64);
        self.noise_records.inc_by(stats.n_noise as f64);
        self.merged_records.inc_by(stats.merged_records as f64);
        self.demoted_clusters.inc_by(stats.demoted_clusters as f64);
        self.cache_hits.inc_by(stats.cache.hits as f64);
        self.cache_misses.inc_by(stats.cache.misses as f64);
        self.run_duration.observe(elapsed.as_secs_f64());
        self.last_noise_ratio.set(stats.noise_ratio);
    }

    /// 失敗した実行をエラー種別ごとに記録する。
    pub fn record_failure(&self, error: &PipelineError) {
        self.runs_failed
            .with_label_values(&[classify_error(error).as_str()])
            .inc();
    }
}
