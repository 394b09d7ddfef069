//! Per-partition, TTL-bounded cache of `(id, embedding)` candidates.
//!
//! Concurrent misses on the same partition may each read the store and
//! overwrite the entry; every writer derives the same value from the same
//! source within the TTL window, so the lock is never held across a read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chunk::CandidateEntry;
use crate::error::StoreError;
use crate::store::ChunkStore;

/// How a candidate list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from a live entry.
    Hit,
    /// Freshly read from the store.
    Miss,
    /// Served from an expired entry because the refresh failed.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Stale => "stale",
        }
    }
}

/// Candidates for one partition plus how they were obtained.
#[derive(Debug, Clone)]
pub struct CandidateLoad {
    pub entries: Arc<Vec<CandidateEntry>>,
    pub status: CacheStatus,
    /// Time since the entries were read from the store.
    pub age: Duration,
}

struct CacheEntry {
    refreshed_at: Instant,
    entries: Arc<Vec<CandidateEntry>>,
}

/// Candidate cache shared by every request of one process.
pub struct CandidateCache {
    store: Arc<dyn ChunkStore>,
    ttl: Duration,
    max_candidates: usize,
    read_timeout: Duration,
    partitions: RwLock<HashMap<String, CacheEntry>>,
}

impl CandidateCache {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        ttl: Duration,
        max_candidates: usize,
        read_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ttl,
            max_candidates: max_candidates.max(1),
            read_timeout,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the live entry for `partition`, or populates it with exactly
    /// one scoped store read.
    ///
    /// A failed read leaves any existing entry in place.
    pub async fn get(&self, partition: &str) -> Result<CandidateLoad, StoreError> {
        if let Some(load) = self.live(partition).await {
            return Ok(load);
        }

        let started = Instant::now();
        let read = tokio::time::timeout(
            self.read_timeout,
            self.store.candidates(partition, self.max_candidates),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            operation: "candidates",
            timeout: self.read_timeout,
        })?;
        let rows = read.map_err(|err| {
            warn!(partition, error = %err, "candidate refresh failed");
            err
        })?;

        let fetched = rows.len();
        let entries: Vec<CandidateEntry> = rows
            .into_iter()
            .filter(|row| !row.embedding.is_empty())
            .collect();
        if fetched >= self.max_candidates {
            warn!(
                partition,
                cap = self.max_candidates,
                "partition reached the candidate cap; chunks beyond it are not ranked"
            );
        }
        debug!(
            partition,
            fetched,
            usable = entries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "candidate cache populated"
        );

        let entries = Arc::new(entries);
        self.partitions.write().await.insert(
            partition.to_string(),
            CacheEntry {
                refreshed_at: started,
                entries: Arc::clone(&entries),
            },
        );
        Ok(CandidateLoad {
            entries,
            status: CacheStatus::Miss,
            age: started.elapsed(),
        })
    }

    /// Whatever entry is held for `partition`, regardless of age.
    pub async fn get_stale(&self, partition: &str) -> Option<CandidateLoad> {
        let partitions = self.partitions.read().await;
        partitions.get(partition).map(|entry| CandidateLoad {
            entries: Arc::clone(&entry.entries),
            status: CacheStatus::Stale,
            age: entry.refreshed_at.elapsed(),
        })
    }

    /// Evicts one partition. Returns whether an entry was held.
    pub async fn invalidate(&self, partition: &str) -> bool {
        self.partitions.write().await.remove(partition).is_some()
    }

    /// Evicts every partition, returning how many were held.
    pub async fn invalidate_all(&self) -> usize {
        let mut partitions = self.partitions.write().await;
        let count = partitions.len();
        partitions.clear();
        count
    }

    async fn live(&self, partition: &str) -> Option<CandidateLoad> {
        let partitions = self.partitions.read().await;
        let entry = partitions.get(partition)?;
        let age = entry.refreshed_at.elapsed();
        (age < self.ttl).then(|| CandidateLoad {
            entries: Arc::clone(&entry.entries),
            status: CacheStatus::Hit,
            age,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::store::MemoryChunkStore;

    const TTL: Duration = Duration::from_secs(600);

    fn chunk(id: &str, source_file: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            content: String::new(),
            embedding,
            page_number: None,
            chapter_title: None,
            source_file: source_file.into(),
        }
    }

    fn fixture() -> (Arc<MemoryChunkStore>, CandidateCache) {
        let store = Arc::new(MemoryChunkStore::from_chunks([
            chunk("a", "manual", vec![1.0, 0.0]),
            chunk("b", "manual", vec![0.0, 1.0]),
            chunk("x", "other", vec![1.0, 1.0]),
        ]));
        let cache = CandidateCache::new(store.clone(), TTL, 800, Duration::from_secs(5));
        (store, cache)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn second_get_within_ttl_is_a_hit() {
        let (store, cache) = fixture();
        let first = cache.get("manual").await.expect("populate");
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(first.entries.len(), 2);

        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        let second = cache.get("manual").await.expect("hit");
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(store.stats().candidate_reads, 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expiry_triggers_one_fresh_read() {
        let (store, cache) = fixture();
        cache.get("manual").await.expect("populate");
        store.insert(chunk("c", "manual", vec![0.5, 0.5])).await;

        tokio::time::advance(TTL).await;
        let refreshed = cache.get("manual").await.expect("refresh");
        assert_eq!(refreshed.status, CacheStatus::Miss);
        assert_eq!(refreshed.entries.len(), 3);
        assert_eq!(store.stats().candidate_reads, 2);

        let again = cache.get("manual").await.expect("hit");
        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(store.stats().candidate_reads, 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_refresh_keeps_stale_entry() {
        let (store, cache) = fixture();
        cache.get("manual").await.expect("populate");
        tokio::time::advance(TTL * 2).await;

        store.set_unavailable(true);
        assert!(matches!(
            cache.get("manual").await,
            Err(StoreError::Unavailable { .. })
        ));
        let stale = cache.get_stale("manual").await.expect("entry survives");
        assert_eq!(stale.status, CacheStatus::Stale);
        assert_eq!(stale.entries.len(), 2);

        store.set_unavailable(false);
        let recovered = cache.get("manual").await.expect("refresh");
        assert_eq!(recovered.status, CacheStatus::Miss);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn slow_refresh_times_out_and_keeps_stale_entry() {
        let (store, cache) = fixture();
        cache.get("manual").await.expect("populate");
        tokio::time::advance(TTL).await;

        store.set_read_latency(Duration::from_secs(30));
        let err = cache.get("manual").await.expect_err("read exceeds 5s");
        assert!(matches!(
            err,
            StoreError::Timeout {
                operation: "candidates",
                ..
            }
        ));
        assert!(err.is_transient());
        let stale = cache.get_stale("manual").await.expect("entry survives");
        assert_eq!(stale.entries.len(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn invalidate_forces_repopulation() {
        let (store, cache) = fixture();
        cache.get("manual").await.expect("populate");
        cache.get("other").await.expect("populate");
        assert!(cache.invalidate("manual").await);
        assert!(!cache.invalidate("manual").await);

        cache.get("manual").await.expect("repopulate");
        assert_eq!(store.stats().candidate_reads, 3);
        assert_eq!(cache.invalidate_all().await, 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cap_and_empty_vectors_bound_the_list() {
        let store = Arc::new(MemoryChunkStore::from_chunks([
            chunk("a", "manual", vec![1.0]),
            chunk("b", "manual", Vec::new()),
            chunk("c", "manual", vec![1.0]),
            chunk("d", "manual", vec![1.0]),
        ]));
        let cache = CandidateCache::new(store, TTL, 3, Duration::from_secs(5));
        let load = cache.get("manual").await.expect("populate");
        let ids: Vec<_> = load.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "c"]);
    }
}
