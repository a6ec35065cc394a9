use std::time::Duration;

use thiserror::Error;

use crate::pipeline::embedding::EmbeddingError;
use crate::pipeline::orchestrator::RunState;

/// A failed run. No partial result accompanies any of these.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("run cancelled after {stage}")]
    Cancelled { stage: RunState },
    #[error("stage after {stage} exceeded timeout of {timeout:?}")]
    TimedOut { stage: RunState, timeout: Duration },
    #[error("clustering worker failed: {0}")]
    Worker(String),
}
