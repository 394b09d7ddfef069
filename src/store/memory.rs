//! In-process store for local runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ChunkStore;
use crate::chunk::{CandidateEntry, Chunk, ChunkDetail, ChunkPatch};
use crate::error::StoreError;

/// Call counters, useful for asserting how often the store was hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub candidate_reads: usize,
    pub detail_reads: usize,
    pub detail_ids_requested: usize,
    pub writes: usize,
    pub id_scans: usize,
}

#[derive(Default)]
struct Counters {
    candidate_reads: AtomicUsize,
    detail_reads: AtomicUsize,
    detail_ids_requested: AtomicUsize,
    writes: AtomicUsize,
    id_scans: AtomicUsize,
}

/// `ChunkStore` backed by an ordered map, with call counters, an outage
/// switch, per-write latency and a switchable read latency.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<BTreeMap<String, Chunk>>,
    counters: Counters,
    unavailable: AtomicBool,
    write_latency: Option<Duration>,
    read_latency_ms: AtomicU64,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store; later chunks with a duplicate id replace earlier ones.
    pub fn from_chunks(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        let map = chunks
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();
        Self {
            chunks: RwLock::new(map),
            ..Self::default()
        }
    }

    /// Every merge sleeps this long before applying, to model a remote write.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = Some(latency);
        self
    }

    /// Every later `candidates` and `fetch_details` call sleeps this long
    /// first. `Duration::ZERO` turns the delay off.
    pub fn set_read_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.read_latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Toggles a simulated outage; while on, every call fails as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn insert(&self, chunk: Chunk) {
        self.chunks.write().await.insert(chunk.id.clone(), chunk);
    }

    pub async fn remove(&self, id: &str) -> Option<Chunk> {
        self.chunks.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Chunk> {
        self.chunks.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            candidate_reads: self.counters.candidate_reads.load(Ordering::SeqCst),
            detail_reads: self.counters.detail_reads.load(Ordering::SeqCst),
            detail_ids_requested: self.counters.detail_ids_requested.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
            id_scans: self.counters.id_scans.load(Ordering::SeqCst),
        }
    }

    async fn read_delay(&self) {
        let millis = self.read_latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn candidates(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<CandidateEntry>, StoreError> {
        self.counters.candidate_reads.fetch_add(1, Ordering::SeqCst);
        self.read_delay().await;
        self.check_available()?;
        let chunks = self.chunks.read().await;
        Ok(chunks
            .values()
            .filter(|chunk| chunk.source_file == partition)
            .take(limit)
            .map(Chunk::to_candidate)
            .collect())
    }

    async fn fetch_details(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkDetail>, StoreError> {
        self.counters.detail_reads.fetch_add(1, Ordering::SeqCst);
        self.counters
            .detail_ids_requested
            .fetch_add(ids.len(), Ordering::SeqCst);
        self.read_delay().await;
        self.check_available()?;
        let chunks = self.chunks.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| chunks.get(id))
            .map(|chunk| (chunk.id.clone(), chunk.to_detail()))
            .collect())
    }

    async fn merge(&self, id: &str, patch: &ChunkPatch) -> Result<(), StoreError> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.write_latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;
        if patch.is_empty() {
            return Err(StoreError::Rejected {
                reason: format!("empty patch for {id}"),
            });
        }
        let mut chunks = self.chunks.write().await;
        let chunk = chunks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        chunk.apply(patch);
        Ok(())
    }

    async fn ids_in_partition(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.counters.id_scans.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let chunks = self.chunks.read().await;
        Ok(chunks
            .values()
            .filter(|chunk| chunk.source_file == partition)
            .map(|chunk| chunk.id.clone())
            .collect())
    }
}
