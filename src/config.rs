use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::observability::tracing::{LogFormat, TelemetryConfig};
use crate::pipeline::density::{DensityParams, SelectionPolicy};
use crate::pipeline::embedding::{EmbeddingProviderConfig, ProviderKind};
use crate::pipeline::orchestrator::PipelineOptions;
use crate::pipeline::quality::QualityThresholds;
use crate::pipeline::summary::{KeywordWeighting, SummaryOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Parameter bundle for one clustering run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringParams {
    pub model_id: String,
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub selection_epsilon: f32,
    pub selection_policy: SelectionPolicy,
    #[serde(default)]
    pub allow_single_cluster: bool,
    pub use_dual_text: bool,
    pub dispersion_threshold: f32,
    /// Distinct pass-1 clusters an attribute word must appear in. 1 disables the check.
    pub min_attribute_clusters: usize,
    /// Density settings for the topic-text pass. Falls back to pass-1 settings.
    #[serde(default)]
    pub pass2: Option<DensityParams>,
    pub merge_threshold: f32,
    pub min_cohesion: f32,
    pub min_separation: f32,
    #[serde(default)]
    pub summary: SummaryOptions,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            model_id: "all-MiniLM-L6-v2".to_string(),
            min_cluster_size: 10,
            min_samples: 3,
            selection_epsilon: 0.0,
            selection_policy: SelectionPolicy::Eom,
            allow_single_cluster: false,
            use_dual_text: true,
            dispersion_threshold: 0.3,
            min_attribute_clusters: 1,
            pass2: None,
            merge_threshold: 0.5,
            min_cohesion: 0.4,
            min_separation: 0.15,
            summary: SummaryOptions::default(),
        }
    }
}

impl ClusteringParams {
    /// Pass-1 density settings.
    #[must_use]
    pub fn density(&self) -> DensityParams {
        DensityParams {
            min_cluster_size: self.min_cluster_size,
            min_samples: self.min_samples,
            selection_epsilon: self.selection_epsilon,
            policy: self.selection_policy,
            allow_single_cluster: self.allow_single_cluster,
        }
    }

    /// Topic-text pass settings.
    #[must_use]
    pub fn pass2_density(&self) -> DensityParams {
        self.pass2.unwrap_or_else(|| self.density())
    }

    #[must_use]
    pub fn quality_thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            min_cohesion: self.min_cohesion,
            min_separation: self.min_separation,
        }
    }

    /// Rejects parameter combinations before any work starts.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidParameters`] describing the first offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model_id.trim().is_empty() {
            return Err(invalid("model_id must not be empty"));
        }
        self.density().validate()?;
        if let Some(pass2) = &self.pass2 {
            pass2.validate()?;
        }
        check_range("dispersion_threshold", self.dispersion_threshold, 0.0, 1.0)?;
        if self.min_attribute_clusters == 0 {
            return Err(invalid("min_attribute_clusters must be at least 1"));
        }
        check_range("merge_threshold", self.merge_threshold, 0.0, 1.0)?;
        check_range("min_cohesion", self.min_cohesion, 0.0, 1.0)?;
        check_range("min_separation", self.min_separation, 0.0, 2.0)?;
        if self.summary.representatives == 0 {
            return Err(invalid("summary.representatives must be at least 1"));
        }
        Ok(())
    }

    /// Reads `CLUSTER_*` variables, falling back to [`ClusteringParams::default`].
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let summary = SummaryOptions {
            representatives: parse_usize(
                "CLUSTER_REPRESENTATIVES",
                defaults.summary.representatives,
            )?,
            top_keywords: parse_usize("CLUSTER_TOP_KEYWORDS", defaults.summary.top_keywords)?,
            weighting: parse_from_str::<KeywordWeighting>(
                "CLUSTER_KEYWORD_WEIGHTING",
                defaults.summary.weighting,
            )?,
        };

        let pass2 = match env::var("CLUSTER_PASS2_MIN_CLUSTER_SIZE").ok() {
            Some(_) => Some(DensityParams {
                min_cluster_size: parse_usize(
                    "CLUSTER_PASS2_MIN_CLUSTER_SIZE",
                    defaults.min_cluster_size,
                )?,
                min_samples: parse_usize("CLUSTER_PASS2_MIN_SAMPLES", defaults.min_samples)?,
                selection_epsilon: parse_f32(
                    "CLUSTER_PASS2_SELECTION_EPSILON",
                    defaults.selection_epsilon,
                )?,
                policy: parse_from_str(
                    "CLUSTER_PASS2_SELECTION_POLICY",
                    defaults.selection_policy,
                )?,
                allow_single_cluster: false,
            }),
            None => None,
        };

        Ok(Self {
            model_id: env::var("EMBEDDING_MODEL").unwrap_or(defaults.model_id),
            min_cluster_size: parse_usize("CLUSTER_MIN_CLUSTER_SIZE", defaults.min_cluster_size)?,
            min_samples: parse_usize("CLUSTER_MIN_SAMPLES", defaults.min_samples)?,
            selection_epsilon: parse_f32("CLUSTER_SELECTION_EPSILON", defaults.selection_epsilon)?,
            selection_policy: parse_from_str(
                "CLUSTER_SELECTION_POLICY",
                defaults.selection_policy,
            )?,
            allow_single_cluster: parse_bool(
                "CLUSTER_ALLOW_SINGLE_CLUSTER",
                defaults.allow_single_cluster,
            )?,
            use_dual_text: parse_bool("CLUSTER_USE_DUAL_TEXT", defaults.use_dual_text)?,
            dispersion_threshold: parse_f32(
                "CLUSTER_DISPERSION_THRESHOLD",
                defaults.dispersion_threshold,
            )?,
            min_attribute_clusters: parse_usize(
                "CLUSTER_MIN_ATTRIBUTE_CLUSTERS",
                defaults.min_attribute_clusters,
            )?,
            pass2,
            merge_threshold: parse_f32("CLUSTER_MERGE_THRESHOLD", defaults.merge_threshold)?,
            min_cohesion: parse_f32("CLUSTER_MIN_COHESION", defaults.min_cohesion)?,
            min_separation: parse_f32("CLUSTER_MIN_SEPARATION", defaults.min_separation)?,
            summary,
        })
    }
}

fn invalid(message: &str) -> PipelineError {
    PipelineError::InvalidParameters(message.to_string())
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<(), PipelineError> {
    if !value.is_finite() || value < min || value > max {
        return Err(PipelineError::InvalidParameters(format!(
            "{name} must be within [{min}, {max}], got {value}"
        )));
    }
    Ok(())
}

/// Everything needed to build and run the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    params: ClusteringParams,
    provider: EmbeddingProviderConfig,
    options: PipelineOptions,
    telemetry: TelemetryConfig,
}

impl PipelineConfig {
    #[must_use]
    pub fn new(
        params: ClusteringParams,
        provider: EmbeddingProviderConfig,
        options: PipelineOptions,
        telemetry: TelemetryConfig,
    ) -> Self {
        Self {
            params,
            provider,
            options,
            telemetry,
        }
    }

    /// 環境変数からパイプライン全体の設定を読み込む。
    ///
    /// 未設定の値はすべて既定値にフォールバックする。埋め込みモデル名は
    /// `EMBEDDING_MODEL` の一箇所から読み、プロバイダとパラメータの両方に設定する。
    ///
    /// # Errors
    /// 値のパースに失敗した場合、もしくは `EMBEDDING_API_KEY_REQUIRED=true` で
    /// `EMBEDDING_API_KEY` が未設定の場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let params = ClusteringParams::from_env()?;
        let defaults = EmbeddingProviderConfig::default();

        let api_key = if parse_bool("EMBEDDING_API_KEY_REQUIRED", false)? {
            Some(env_var("EMBEDDING_API_KEY")?)
        } else {
            env::var("EMBEDDING_API_KEY").ok()
        };

        let provider = EmbeddingProviderConfig {
            kind: parse_from_str::<ProviderKind>("EMBEDDING_PROVIDER", defaults.kind)?,
            base_url: env::var("EMBEDDING_BASE_URL").unwrap_or(defaults.base_url),
            model_id: params.model_id.clone(),
            dimension: parse_usize("EMBEDDING_DIMENSION", defaults.dimension)?,
            api_key,
            proxy: env::var("EMBEDDING_PROXY").ok().filter(|p| !p.trim().is_empty()),
            connect_timeout: parse_duration_ms("EMBEDDING_CONNECT_TIMEOUT_MS", 3000)?,
            total_timeout: parse_duration_ms("EMBEDDING_TOTAL_TIMEOUT_MS", 60000)?,
            batch_size: parse_non_zero("EMBEDDING_BATCH_SIZE", defaults.batch_size)?,
            max_concurrency: parse_non_zero("EMBEDDING_MAX_CONCURRENCY", defaults.max_concurrency)?,
        };

        let options = PipelineOptions {
            embedding_timeout: parse_optional_duration_ms("CLUSTER_EMBEDDING_TIMEOUT_MS")?,
            clustering_timeout: parse_optional_duration_ms("CLUSTER_CLUSTERING_TIMEOUT_MS")?,
        };

        let telemetry = TelemetryConfig {
            service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
            log_format: parse_from_str::<LogFormat>("LOG_FORMAT", LogFormat::Json)?,
            default_filter: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.trim().is_empty()),
            sampling_ratio: parse_ratio("OTEL_SAMPLING_RATIO", 1.0)?,
        };

        Ok(Self {
            params,
            provider,
            options,
            telemetry,
        })
    }

    #[must_use]
    pub fn params(&self) -> &ClusteringParams {
        &self.params
    }

    #[must_use]
    pub fn provider(&self) -> &EmbeddingProviderConfig {
        &self.provider
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    #[must_use]
    pub fn telemetry(&self) -> &TelemetryConfig {
        &self.telemetry
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_from_str<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = String>,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|error: String| ConfigError::Invalid {
            name,
            source: anyhow::anyhow!(error),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value = parse_usize(name, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("must be greater than zero"),
        });
    }
    Ok(value)
}

fn parse_f32(name: &'static str, default: f32) -> Result<f32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<f32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_ratio(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let value = raw.trim().parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0 and 1"),
        });
    }
    Ok(value)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default_ms.to_string());
    let ms = raw.trim().parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    Ok(Duration::from_millis(ms))
}

fn parse_optional_duration_ms(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            let ms = raw.trim().parse::<u64>().map_err(|error| ConfigError::Invalid {
                name,
                source: anyhow::Error::new(error),
            })?;
            Ok(Some(Duration::from_millis(ms)))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CLUSTER_VARS: &[&str] = &[
        "EMBEDDING_MODEL",
        "CLUSTER_MIN_CLUSTER_SIZE",
        "CLUSTER_MIN_SAMPLES",
        "CLUSTER_SELECTION_EPSILON",
        "CLUSTER_SELECTION_POLICY",
        "CLUSTER_USE_DUAL_TEXT",
        "CLUSTER_MERGE_THRESHOLD",
        "CLUSTER_PASS2_MIN_CLUSTER_SIZE",
        "CLUSTER_PASS2_MIN_SAMPLES",
        "EMBEDDING_PROVIDER",
        "EMBEDDING_API_KEY",
        "EMBEDDING_API_KEY_REQUIRED",
        "EMBEDDING_PROXY",
        "CLUSTER_EMBEDDING_TIMEOUT_MS",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_SAMPLING_RATIO",
        "LOG_FORMAT",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        CLUSTER_VARS.iter().map(|name| (*name, None)).collect()
    }

    #[test]
    fn clustering_params_defaults() {
        let params = ClusteringParams::default();
        assert_eq!(params.min_cluster_size, 10);
        assert_eq!(params.min_samples, 3);
        assert_eq!(params.selection_policy, SelectionPolicy::Eom);
        assert!((params.dispersion_threshold - 0.3).abs() < f32::EPSILON);
        assert!((params.merge_threshold - 0.5).abs() < f32::EPSILON);
        assert!((params.min_cohesion - 0.4).abs() < f32::EPSILON);
        assert!((params.min_separation - 0.15).abs() < f32::EPSILON);
        assert_eq!(params.min_attribute_clusters, 1);
        assert_eq!(params.model_id, "all-MiniLM-L6-v2");
        assert!(params.validate().is_ok());
    }

    #[rstest]
    #[case::negative_merge(ClusteringParams { merge_threshold: -0.1, ..ClusteringParams::default() })]
    #[case::merge_above_one(ClusteringParams { merge_threshold: 1.5, ..ClusteringParams::default() })]
    #[case::tiny_cluster(ClusteringParams { min_cluster_size: 1, ..ClusteringParams::default() })]
    #[case::zero_samples(ClusteringParams { min_samples: 0, ..ClusteringParams::default() })]
    #[case::nan_cohesion(ClusteringParams { min_cohesion: f32::NAN, ..ClusteringParams::default() })]
    #[case::negative_dispersion(ClusteringParams { dispersion_threshold: -0.1, ..ClusteringParams::default() })]
    #[case::negative_cohesion(ClusteringParams { min_cohesion: -0.2, ..ClusteringParams::default() })]
    #[case::negative_separation(ClusteringParams { min_separation: -0.05, ..ClusteringParams::default() })]
    #[case::zero_attribute_clusters(ClusteringParams { min_attribute_clusters: 0, ..ClusteringParams::default() })]
    #[case::empty_model(ClusteringParams { model_id: " ".to_string(), ..ClusteringParams::default() })]
    #[case::bad_pass2(ClusteringParams { pass2: Some(DensityParams::new(0, 1)), ..ClusteringParams::default() })]
    fn invalid_params_fail_fast(#[case] params: ClusteringParams) {
        assert!(matches!(
            params.validate(),
            Err(PipelineError::InvalidParameters(_))
        ));
    }

    #[test]
    fn zero_thresholds_are_accepted() {
        let params = ClusteringParams {
            dispersion_threshold: 0.0,
            merge_threshold: 0.0,
            min_cohesion: 0.0,
            min_separation: 0.0,
            ..ClusteringParams::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn pass2_falls_back_to_pass1() {
        let params = ClusteringParams::default();
        assert_eq!(params.pass2_density(), params.density());

        let override_params = ClusteringParams {
            pass2: Some(DensityParams::new(4, 2)),
            ..ClusteringParams::default()
        };
        assert_eq!(override_params.pass2_density().min_cluster_size, 4);
    }

    #[test]
    fn from_env_uses_defaults_when_unset() {
        temp_env::with_vars(cleared(), || {
            let config = PipelineConfig::from_env().expect("config should load");
            assert_eq!(config.params(), &ClusteringParams::default());
            assert_eq!(config.provider().kind, ProviderKind::Ollama);
            assert_eq!(config.provider().model_id, "all-MiniLM-L6-v2");
            assert!(config.provider().proxy.is_none());
            assert!(config.options().embedding_timeout.is_none());
            assert!(config.telemetry().otlp_endpoint.is_none());
            assert_eq!(config.telemetry().log_format, LogFormat::Json);
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        let mut vars = cleared();
        vars.extend([
            ("EMBEDDING_MODEL", Some("text-embedding-3-small")),
            ("EMBEDDING_PROVIDER", Some("openai")),
            ("CLUSTER_MIN_CLUSTER_SIZE", Some("5")),
            ("CLUSTER_MIN_SAMPLES", Some("2")),
            ("CLUSTER_SELECTION_POLICY", Some("leaf")),
            ("CLUSTER_USE_DUAL_TEXT", Some("false")),
            ("CLUSTER_PASS2_MIN_CLUSTER_SIZE", Some("4")),
            ("EMBEDDING_PROXY", Some("http://proxy.internal:3128")),
            ("CLUSTER_EMBEDDING_TIMEOUT_MS", Some("1500")),
        ]);
        temp_env::with_vars(vars, || {
            let config = PipelineConfig::from_env().expect("config should load");
            let params = config.params();
            assert_eq!(params.model_id, "text-embedding-3-small");
            assert_eq!(params.min_cluster_size, 5);
            assert_eq!(params.min_samples, 2);
            assert_eq!(params.selection_policy, SelectionPolicy::Leaf);
            assert!(!params.use_dual_text);
            assert_eq!(params.pass2.map(|p| p.min_cluster_size), Some(4));
            assert_eq!(config.provider().kind, ProviderKind::OpenAiCompatible);
            assert_eq!(config.provider().model_id, "text-embedding-3-small");
            assert_eq!(
                config.provider().proxy.as_deref(),
                Some("http://proxy.internal:3128")
            );
            assert_eq!(
                config.options().embedding_timeout,
                Some(Duration::from_millis(1500))
            );
        });
    }

    #[rstest]
    #[case("CLUSTER_MIN_CLUSTER_SIZE", "many")]
    #[case("CLUSTER_SELECTION_POLICY", "kmeans")]
    #[case("CLUSTER_USE_DUAL_TEXT", "maybe")]
    #[case("OTEL_SAMPLING_RATIO", "1.5")]
    fn from_env_rejects_bad_values(#[case] name: &'static str, #[case] value: &'static str) {
        let mut vars = cleared();
        vars.push((name, Some(value)));
        temp_env::with_vars(vars, || {
            let error = PipelineConfig::from_env().expect_err("should fail");
            match error {
                ConfigError::Invalid { name: failed, .. } => assert_eq!(failed, name),
                ConfigError::Missing(other) => panic!("unexpected missing {other}"),
            }
        });
    }

    #[test]
    fn required_api_key_must_be_present() {
        let mut vars = cleared();
        vars.push(("EMBEDDING_API_KEY_REQUIRED", Some("true")));
        temp_env::with_vars(vars, || {
            let error = PipelineConfig::from_env().expect_err("should fail");
            assert!(matches!(error, ConfigError::Missing("EMBEDDING_API_KEY")));
        });
    }
}
