use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// ログの出力形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "plain" => Ok(Self::Text),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Text => "text",
        })
    }
}

/// トレーシング初期化の設定。環境変数は読まない。
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_format: LogFormat,
    /// `RUST_LOG` 形式のフィルタ。
    pub default_filter: String,
    pub otlp_endpoint: Option<String>,
    /// 0.0〜1.0
    pub sampling_ratio: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            log_format: LogFormat::Json,
            default_filter: "info".to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

/// Tracing サブスクライバを一度だけ初期化する。
///
/// `otlp_endpoint` が設定されている場合、OTLPエクスポーターを使用してトレースを送信する。
/// エクスポーターの初期化に失敗した場合は fmt レイヤーのみで続行する。
/// 二回目以降の呼び出しは何もしない。
///
/// # Errors
/// フィルタが不正な場合、または別のグローバルサブスクライバが既に設定されている場合はエラーを返す。
pub fn init(config: &TelemetryConfig) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(&config.default_filter)
            .with_context(|| format!("invalid log filter: {}", config.default_filter))?;

        let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .with_target(false)
                .json()
                .boxed(),
            LogFormat::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
        };

        let (tracer, otel_error) = match config.otlp_endpoint.as_deref() {
            Some(endpoint) => match init_tracer(config, endpoint) {
                Ok(tracer) => (Some(tracer), None),
                Err(e) => (None, Some(e)),
            },
            None => (None, None),
        };
        let otel_enabled = tracer.is_some();
        let otel_layer = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(otel_layer)
            .with(env_filter)
            .try_init()
            .map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;

        if let Some(e) = otel_error {
            warn!(
                otel_enabled = false,
                error = %e,
                "Tracing initialized without OpenTelemetry (init failed)"
            );
        } else {
            info!(
                otel_enabled,
                service = %config.service_name,
                format = %config.log_format,
                "Tracing initialized"
            );
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// OTLPエクスポーター経由でOpenTelemetryトレーサーを初期化する。
///
/// # Errors
/// トレーサーの初期化に失敗した場合はエラーを返す。
fn init_tracer(config: &TelemetryConfig, endpoint: &str) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(config.sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(config.service_name.clone());

    // グローバルトレーサープロバイダーを設定
    global::set_tracer_provider(tracer_provider.clone());
    TRACER_PROVIDER.set(tracer_provider).ok();

    Ok(tracer)
}

/// 未送信のスパンをフラッシュしてエクスポーターを停止する。OTLP 未使用時は何もしない。
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "failed to shut down tracer provider");
        }
    }
}
