pub mod attribute;
pub mod cache;
pub mod density;
pub mod dual_text;
pub mod embedding;
pub mod merge;
pub mod normalize;
pub mod orchestrator;
pub mod quality;
pub mod summary;
pub mod types;

pub use cache::{CacheStats, EmbeddingCache, EmbeddingStore, InMemoryEmbeddingStore};
pub use density::{DensityClusterer, DensityParams, SelectionPolicy};
pub use embedding::{EmbeddingError, EmbeddingProvider};
pub use normalize::TextNormalizer;
