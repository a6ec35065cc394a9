#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod util;

pub use config::{ClusteringParams, ConfigError, PipelineConfig};
pub use error::PipelineError;
pub use observability::Telemetry;
pub use pipeline::orchestrator::{ClusteringPipeline, PipelineOptions, RunState};
pub use pipeline::types::{ClusteringResult, Record, RecordId};
