//! Document store capabilities consumed by retrieval and the bulk pipeline.

pub mod memory;
pub mod pgvector;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::chunk::{CandidateEntry, ChunkDetail, ChunkPatch};
use crate::error::StoreError;

pub use memory::{MemoryChunkStore, StoreStats};
pub use pgvector::{PgChunkStore, TableName};

/// Capability contract for the corpus document store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Scoped read of one partition projecting only `(id, embedding)`,
    /// returning at most `limit` rows.
    async fn candidates(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<CandidateEntry>, StoreError>;

    /// Batched point read. Ids that no longer exist are absent from the map.
    async fn fetch_details(&self, ids: &[String])
        -> Result<HashMap<String, ChunkDetail>, StoreError>;

    /// Point merge write: fields set in `patch` overwrite, others stay.
    async fn merge(&self, id: &str, patch: &ChunkPatch) -> Result<(), StoreError>;

    /// Every id in a partition, uncapped.
    async fn ids_in_partition(&self, partition: &str) -> Result<Vec<String>, StoreError>;
}
