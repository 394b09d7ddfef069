use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corpusrag::{
    BulkMutationPipeline, CandidateEntry, Chunk, ChunkDetail, ChunkPatch, ChunkStore, Embedder,
    EmbeddingError, MemoryChunkStore, PipelineConfig, RecordBatch, RetrievalConfig,
    RetrievalRequest, Retriever, RetryPolicy, StoreError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn chunk(id: String, source_file: &str) -> Chunk {
    Chunk {
        id,
        content: "Wash hands before and after patient contact.".into(),
        embedding: vec![1.0, 0.0],
        page_number: Some(88),
        chapter_title: Some("Infection control".into()),
        source_file: source_file.into(),
    }
}

fn corpus(n: usize, source_file: &str) -> MemoryChunkStore {
    MemoryChunkStore::from_chunks((0..n).map(|i| chunk(format!("c{i:05}"), source_file)))
}

/// Fails a fixed fraction of merges with contention, independently per call.
struct FlakyStore {
    inner: MemoryChunkStore,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    injected: AtomicU64,
}

impl FlakyStore {
    fn new(inner: MemoryChunkStore, failure_rate: f64) -> Self {
        Self {
            inner,
            failure_rate,
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
            injected: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ChunkStore for FlakyStore {
    async fn candidates(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<CandidateEntry>, StoreError> {
        self.inner.candidates(partition, limit).await
    }

    async fn fetch_details(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkDetail>, StoreError> {
        self.inner.fetch_details(ids).await
    }

    async fn merge(&self, id: &str, patch: &ChunkPatch) -> Result<(), StoreError> {
        let fail = self.rng.lock().expect("rng lock").gen_bool(self.failure_rate);
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Contention {
                id: id.to_string(),
                reason: "deadlock detected".into(),
            });
        }
        self.inner.merge(id, patch).await
    }

    async fn ids_in_partition(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        self.inner.ids_in_partition(partition).await
    }
}

fn pipeline_config(max_in_flight: usize) -> PipelineConfig {
    PipelineConfig::new(max_in_flight, RetryPolicy::default())
        .expect("valid config")
        .with_shuffle_seed(Some(11))
}

#[tokio::test(start_paused = true)]
async fn ten_thousand_records_survive_five_percent_contention() {
    let store = Arc::new(FlakyStore::new(
        corpus(10_000, "PSW By Mary J. Wilk").with_write_latency(Duration::from_millis(5)),
        0.05,
    ));
    let batch = RecordBatch::from_partition(
        store.as_ref(),
        "PSW By Mary J. Wilk",
        ChunkPatch::rename_source("PSW By Mary J. Wilk (2nd ed.)"),
    )
    .await
    .expect("select");
    assert_eq!(batch.len(), 10_000);

    let pipeline = BulkMutationPipeline::new(store.clone(), pipeline_config(150));
    let report = pipeline.run(batch).await;

    assert_eq!(report.submitted, 10_000);
    assert_eq!(report.permanently_failed, 0);
    assert_eq!(report.succeeded, 10_000);
    assert!(report.is_complete());
    assert!(report.retries > 0);
    assert_eq!(report.retries, store.injected.load(Ordering::SeqCst));
    assert_eq!(
        store
            .ids_in_partition("PSW By Mary J. Wilk (2nd ed.)")
            .await
            .expect("scan")
            .len(),
        10_000
    );
}

#[tokio::test(start_paused = true)]
async fn run_time_scales_with_the_admission_window() {
    async fn elapsed_with(window: usize) -> Duration {
        let store = Arc::new(corpus(3_000, "old").with_write_latency(Duration::from_millis(10)));
        let batch = RecordBatch::from_partition(store.as_ref(), "old", ChunkPatch::rename_source("new"))
            .await
            .expect("select");
        let report = BulkMutationPipeline::new(store, pipeline_config(window))
            .run(batch)
            .await;
        assert_eq!(report.succeeded, 3_000);
        report.elapsed
    }

    let wide = elapsed_with(150).await;
    let narrow = elapsed_with(50).await;
    // 20 waves of 10ms against 60.
    assert!(wide >= Duration::from_millis(200) && wide < Duration::from_millis(300));
    assert!(narrow >= Duration::from_millis(600) && narrow < Duration::from_millis(700));
}

struct AxisEmbedder;

impl Embedder for AxisEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(vec![1.0, 0.0])
    }
}

#[tokio::test]
async fn renamed_chunks_appear_after_invalidation() {
    let store = Arc::new(corpus(12, "draft"));
    let retriever = Retriever::new(
        Arc::new(AxisEmbedder),
        store.clone(),
        RetrievalConfig::default().with_default_partition("manual"),
    );
    let request = RetrievalRequest::new("hand hygiene");

    let before = retriever.retrieve(&request).await.expect("empty success");
    assert!(before.chunks.is_empty());

    let batch = RecordBatch::from_partition(store.as_ref(), "draft", ChunkPatch::rename_source("manual"))
        .await
        .expect("select");
    let report = BulkMutationPipeline::new(store.clone(), pipeline_config(4))
        .run(batch)
        .await;
    assert_eq!(report.succeeded, 12);

    let cached = retriever.retrieve(&request).await.expect("cache hit");
    assert!(cached.chunks.is_empty(), "live entry predates the rename");

    assert!(retriever.cache().invalidate("manual").await);
    let after = retriever.retrieve(&request).await.expect("fresh read");
    assert_eq!(after.chunks.len(), 5);
    assert!(after.chunks.iter().all(|c| c.source_file == "manual"));
    assert_eq!(after.meta.scanned, 12);
}
