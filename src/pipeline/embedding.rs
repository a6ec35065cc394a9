//! Embedding provider boundary.
//!
//! Providers form a closed set selected once from [`EmbeddingProviderConfig`]:
//! an OpenAI-compatible HTTP endpoint, an Ollama endpoint, or (with the
//! `local-model` feature) a rust-bert sentence model running on CPU.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Failure reported by an embedding provider.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("embedding provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    #[error("embedding model failed: {0}")]
    Model(String),
    #[error("invalid embedding provider configuration: {0}")]
    Configuration(String),
}

/// Computes fixed-length vectors for batches of normalized texts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + fmt::Debug {
    /// Identifier of the model; part of every cache key.
    fn model_id(&self) -> &str;

    /// Length of every returned vector.
    fn dimension(&self) -> usize;

    /// Embeds `batch`, returning one vector per text in the same order.
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Which adapter to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `POST {base}/v1/embeddings` with `{model, input}`.
    OpenAiCompatible,
    /// `POST {base}/api/embed` with `{model, input}`.
    #[default]
    Ollama,
    /// In-process rust-bert sentence embeddings.
    LocalModel,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai_compatible" | "openai-compatible" => Ok(Self::OpenAiCompatible),
            "ollama" => Ok(Self::Ollama),
            "local" | "local_model" | "local-model" => Ok(Self::LocalModel),
            other => Err(format!("unknown embedding provider: {other}")),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenAiCompatible => "openai_compatible",
            Self::Ollama => "ollama",
            Self::LocalModel => "local_model",
        };
        f.write_str(name)
    }
}

/// Explicit provider settings. Nothing here is read from or written to the
/// process environment after construction.
#[derive(Clone, PartialEq)]
pub struct EmbeddingProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model_id: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    /// Proxy URL applied to all requests. `None` disables proxying entirely.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    /// Texts per provider call.
    pub batch_size: usize,
    /// Provider calls in flight at once.
    pub max_concurrency: usize,
}

impl fmt::Debug for EmbeddingProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("proxy", &self.proxy)
            .field("connect_timeout", &self.connect_timeout)
            .field("total_timeout", &self.total_timeout)
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Ollama,
            base_url: "http://localhost:11434/".to_string(),
            model_id: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            api_key: None,
            proxy: None,
            connect_timeout: Duration::from_secs(3),
            total_timeout: Duration::from_secs(60),
            batch_size: 256,
            max_concurrency: num_cpus::get().clamp(1, 8),
        }
    }
}

/// Builds the adapter named by `config.kind`.
///
/// # Errors
/// Returns [`EmbeddingError::Configuration`] when the URL, proxy or model is
/// unusable, or when `LocalModel` is requested without the `local-model` feature.
pub fn build_provider(
    config: &EmbeddingProviderConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    match config.kind {
        ProviderKind::OpenAiCompatible | ProviderKind::Ollama => {
            Ok(Arc::new(HttpEmbeddingProvider::new(config)?))
        }
        ProviderKind::LocalModel => build_local(config),
    }
}

#[cfg(feature = "local-model")]
fn build_local(
    config: &EmbeddingProviderConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    Ok(Arc::new(local::LocalEmbeddingProvider::new(config)?))
}

#[cfg(not(feature = "local-model"))]
fn build_local(
    _config: &EmbeddingProviderConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    Err(EmbeddingError::Configuration(
        "local_model provider requires the `local-model` feature".to_string(),
    ))
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP adapter for OpenAI-compatible and Ollama embedding endpoints.
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    client: Client,
    endpoint: Url,
    kind: ProviderKind,
    model_id: String,
    dimension: usize,
    api_key: Option<String>,
}

impl fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("endpoint", &self.endpoint.as_str())
            .field("kind", &self.kind)
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

impl HttpEmbeddingProvider {
    /// # Errors
    /// Returns [`EmbeddingError::Configuration`] for an invalid base URL or
    /// proxy, or when `config.kind` is not an HTTP provider.
    pub fn new(config: &EmbeddingProviderConfig) -> Result<Self, EmbeddingError> {
        let path = match config.kind {
            ProviderKind::OpenAiCompatible => "v1/embeddings",
            ProviderKind::Ollama => "api/embed",
            ProviderKind::LocalModel => {
                return Err(EmbeddingError::Configuration(
                    "local_model is not an HTTP provider".to_string(),
                ));
            }
        };

        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout);
        builder = match &config.proxy {
            Some(proxy) => builder.proxy(
                Proxy::all(proxy)
                    .map_err(|e| EmbeddingError::Configuration(format!("proxy {proxy}: {e}")))?,
            ),
            None => builder.no_proxy(),
        };
        let client = builder
            .build()
            .map_err(|e| EmbeddingError::Configuration(format!("http client: {e}")))?;

        let base = if config.base_url.ends_with('/') {
            config.base_url.clone()
        } else {
            format!("{}/", config.base_url)
        };
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join(path))
            .map_err(|e| {
                EmbeddingError::Configuration(format!("base url {}: {e}", config.base_url))
            })?;

        Ok(Self {
            client,
            endpoint,
            kind: config.kind,
            model_id: config.model_id.clone(),
            dimension: config.dimension,
            api_key: config.api_key.clone(),
        })
    }

    fn decode(&self, body: &[u8], expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = match self.kind {
            ProviderKind::OpenAiCompatible => {
                let mut parsed: OpenAiEmbeddingResponse = serde_json::from_slice(body)
                    .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
                parsed.data.sort_by_key(|item| item.index);
                if parsed
                    .data
                    .iter()
                    .enumerate()
                    .any(|(position, item)| position != item.index)
                {
                    return Err(EmbeddingError::Malformed(
                        "embedding indices are not contiguous".to_string(),
                    ));
                }
                parsed.data.into_iter().map(|item| item.embedding).collect()
            }
            ProviderKind::Ollama => {
                let parsed: OllamaEmbedResponse = serde_json::from_slice(body)
                    .map_err(|e| EmbeddingError::Malformed(e.to_string()))?;
                parsed.embeddings
            }
            ProviderKind::LocalModel => {
                return Err(EmbeddingError::Configuration(
                    "local_model is not an HTTP provider".to_string(),
                ));
            }
        };

        if vectors.len() != expected {
            return Err(EmbeddingError::Malformed(format!(
                "expected {expected} vectors, got {}",
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = %self.kind,
            model = %self.model_id,
            count = batch.len(),
            "requesting embeddings"
        );

        let mut request = self.client.post(self.endpoint.clone()).json(&EmbedRequest {
            model: &self.model_id,
            input: batch,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        self.decode(&body, batch.len())
    }
}

#[cfg(feature = "local-model")]
mod local {
    use std::fmt;
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_bert::pipelines::sentence_embeddings::{
        SentenceEmbeddingsBuilder, SentenceEmbeddingsModel, SentenceEmbeddingsModelType,
    };
    use tokio::sync::Mutex;

    use super::{EmbeddingError, EmbeddingProvider, EmbeddingProviderConfig};

    /// rust-bert sentence model on CPU. Encoding runs on the blocking pool.
    #[derive(Clone)]
    pub(super) struct LocalEmbeddingProvider {
        model: Arc<Mutex<SentenceEmbeddingsModel>>,
        model_id: String,
        dimension: usize,
    }

    impl fmt::Debug for LocalEmbeddingProvider {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("LocalEmbeddingProvider")
                .field("model_id", &self.model_id)
                .field("dimension", &self.dimension)
                .finish_non_exhaustive()
        }
    }

    impl LocalEmbeddingProvider {
        pub(super) fn new(config: &EmbeddingProviderConfig) -> Result<Self, EmbeddingError> {
            let model_type = match config.model_id.as_str() {
                "all-MiniLM-L6-v2" | "all-minilm" => SentenceEmbeddingsModelType::AllMiniLmL6V2,
                "all-MiniLM-L12-v2" => SentenceEmbeddingsModelType::AllMiniLmL12V2,
                "all-distilroberta-v1" => SentenceEmbeddingsModelType::AllDistilrobertaV1,
                other => {
                    return Err(EmbeddingError::Configuration(format!(
                        "unsupported local model: {other}"
                    )));
                }
            };

            // Model download and load block; keep them off any async worker.
            let model = std::thread::spawn(move || {
                SentenceEmbeddingsBuilder::remote(model_type).create_model()
            })
            .join()
            .map_err(|_| EmbeddingError::Model("model loader thread panicked".to_string()))?
            .map_err(|e| EmbeddingError::Model(e.to_string()))?;

            Ok(Self {
                model: Arc::new(Mutex::new(model)),
                model_id: config.model_id.clone(),
                dimension: config.dimension,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalEmbeddingProvider {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if batch.is_empty() {
                return Ok(Vec::new());
            }
            let model = Arc::clone(&self.model);
            let texts = batch.to_vec();
            tokio::task::spawn_blocking(move || {
                let model = model.blocking_lock();
                model.encode(&texts)
            })
            .await
            .map_err(|e| EmbeddingError::Model(format!("embedding task failed: {e}")))?
            .map_err(|e| EmbeddingError::Model(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(kind: ProviderKind, base_url: String) -> EmbeddingProviderConfig {
        EmbeddingProviderConfig {
            kind,
            base_url,
            model_id: "test-model".to_string(),
            dimension: 2,
            api_key: Some("secret".to_string()),
            proxy: None,
            connect_timeout: Duration::from_secs(1),
            total_timeout: Duration::from_secs(5),
            batch_size: 16,
            max_concurrency: 2,
        }
    }

    #[tokio::test]
    async fn openai_adapter_orders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({
                "model": "test-model",
                "input": ["budget planner", "wedding checklist"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            HttpEmbeddingProvider::new(&test_config(ProviderKind::OpenAiCompatible, server.uri()))
                .expect("provider");
        let vectors = provider
            .embed(&["budget planner".to_string(), "wedding checklist".to_string()])
            .await
            .expect("embeddings");

        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn ollama_adapter_parses_embeddings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-model",
                "embeddings": [[0.5, 0.5]]
            })))
            .mount(&server)
            .await;

        let provider = HttpEmbeddingProvider::new(&test_config(ProviderKind::Ollama, server.uri()))
            .expect("provider");
        let vectors = provider
            .embed(&["candle".to_string()])
            .await
            .expect("embeddings");

        assert_eq!(vectors, vec![vec![0.5, 0.5]]);
        assert_eq!(provider.model_id(), "test-model");
        assert_eq!(provider.dimension(), 2);
    }

    #[tokio::test]
    async fn error_status_surfaces_as_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let provider = HttpEmbeddingProvider::new(&test_config(ProviderKind::Ollama, server.uri()))
            .expect("provider");
        let error = provider
            .embed(&["candle".to_string()])
            .await
            .expect_err("should fail");

        match error {
            EmbeddingError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn count_mismatch_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": [[1.0, 0.0]]})),
            )
            .mount(&server)
            .await;

        let provider = HttpEmbeddingProvider::new(&test_config(ProviderKind::Ollama, server.uri()))
            .expect("provider");
        let error = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .expect_err("should fail");

        assert!(matches!(error, EmbeddingError::Malformed(_)));
    }

    #[tokio::test]
    async fn empty_batch_skips_request() {
        let provider = HttpEmbeddingProvider::new(&test_config(
            ProviderKind::Ollama,
            "http://127.0.0.1:9".to_string(),
        ))
        .expect("provider");
        assert!(provider.embed(&[]).await.expect("empty").is_empty());
    }

    #[test]
    fn invalid_base_url_is_configuration_error() {
        let error = HttpEmbeddingProvider::new(&test_config(
            ProviderKind::Ollama,
            "not a url".to_string(),
        ))
        .expect_err("should fail");
        assert!(matches!(error, EmbeddingError::Configuration(_)));
    }

    #[cfg(not(feature = "local-model"))]
    #[test]
    fn local_model_requires_feature() {
        let config = EmbeddingProviderConfig {
            kind: ProviderKind::LocalModel,
            ..EmbeddingProviderConfig::default()
        };
        assert!(matches!(
            build_provider(&config),
            Err(EmbeddingError::Configuration(_))
        ));
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!("openai".parse::<ProviderKind>(), Ok(ProviderKind::OpenAiCompatible));
        assert_eq!("Ollama".parse::<ProviderKind>(), Ok(ProviderKind::Ollama));
        assert_eq!("local-model".parse::<ProviderKind>(), Ok(ProviderKind::LocalModel));
        assert!("gpt".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = test_config(ProviderKind::Ollama, "http://localhost".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
