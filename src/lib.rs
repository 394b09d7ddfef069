//! Semantic retrieval over a chunked reference corpus, plus the bulk
//! mutation tooling that keeps the corpus metadata consistent.

pub mod api;
pub mod backoff;
pub mod bulk;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedder;
pub mod error;
pub mod resolver;
pub mod retriever;
pub mod scorer;
pub mod store;
pub mod telemetry;

pub use api::{router, AppState};
pub use backoff::{retry_with_backoff, RetryOutcome, RetryPolicy};
pub use bulk::{BulkMutationPipeline, CancelHandle, PipelineReport, RecordBatch};
pub use cache::{CacheStatus, CandidateCache, CandidateLoad};
pub use chunk::{CandidateEntry, Chunk, ChunkDetail, ChunkPatch, MutationRecord};
pub use config::{PipelineConfig, RetrievalConfig, DEFAULT_PARTITION};
pub use embedder::Embedder;
pub use error::{ConfigError, EmbeddingError, RetrieveError, StoreError, UpstreamError};
pub use resolver::DetailResolver;
pub use retriever::{RetrievalRequest, RetrievalResult, RetrievedChunk, Retriever};
pub use scorer::{cosine_similarity, score, Ranking, ScoredCandidate};
pub use store::{ChunkStore, MemoryChunkStore, PgChunkStore};
