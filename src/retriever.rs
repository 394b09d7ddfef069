//! Request lifecycle: validate, embed, load candidates, score, hydrate,
//! assemble.

use std::sync::Arc;
use std::time::Instant;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cache::{CacheStatus, CandidateCache, CandidateLoad};
use crate::chunk::ChunkDetail;
use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::error::{EmbeddingError, RetrieveError};
use crate::resolver::DetailResolver;
use crate::scorer::{score, ScoredCandidate};
use crate::store::ChunkStore;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
const QUERY_PREVIEW_CHARS: usize = 64;

/// Inbound retrieval request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default, alias = "sourceFile", alias = "source_file")]
    pub partition: Option<String>,
    /// Requested result count; out-of-range values are clamped, not rejected.
    #[serde(
        default,
        rename = "topK",
        alias = "top_k",
        deserialize_with = "whole_number"
    )]
    pub top_k: Option<i64>,
}

/// Accepts integers and integral floats (`3.0`), saturating at the `i64` range.
fn whole_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(k) = number.as_i64() {
        return Ok(Some(k));
    }
    if number.is_u64() {
        return Ok(Some(i64::MAX));
    }
    match number.as_f64() {
        Some(k) if k.is_finite() && k.fract() == 0.0 => Ok(Some(k as i64)),
        _ => Err(de::Error::custom(format!(
            "topK must be a whole number, got {number}"
        ))),
    }
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn top_k(mut self, top_k: i64) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// Ranked passages, the prompt-ready context built from them, and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub context: String,
    pub chunks: Vec<RetrievedChunk>,
    pub meta: RetrievalMeta,
}

/// One hydrated winner, in ranked order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub similarity: f32,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
    pub source_file: String,
}

impl RetrievedChunk {
    fn hydrate(winner: ScoredCandidate, detail: ChunkDetail) -> Self {
        Self {
            id: winner.id,
            similarity: winner.similarity,
            content: detail.content,
            page_number: detail.page_number,
            chapter_title: detail.chapter_title,
            source_file: detail.source_file,
        }
    }

    fn header(&self) -> String {
        let page = self
            .page_number
            .map(|page| page.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "Source {} • Page {} • sim={:.3}",
            self.source_file, page, self.similarity
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalMeta {
    pub partition: String,
    /// Candidates scored.
    pub scanned: usize,
    /// Candidates at or above the floor, before truncation.
    pub kept: usize,
    /// Chunks in the response after hydration.
    pub returned: usize,
    /// Effective (clamped) k.
    pub top_k: usize,
    pub similarity_floor: f32,
    pub cache: CacheStatus,
    pub timings: StageTimings,
}

/// Per-stage latency in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub embed_ms: f64,
    pub candidates_ms: f64,
    pub score_ms: f64,
    pub hydrate_ms: f64,
    pub total_ms: f64,
}

/// Lifecycle stage, reported when a request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Embed,
    LoadCandidates,
    Hydrate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Embed => "embed",
            Self::LoadCandidates => "load_candidates",
            Self::Hydrate => "hydrate",
        }
    }
}

/// Composes embedding, candidate cache, scoring and hydration.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    cache: Arc<CandidateCache>,
    resolver: DetailResolver,
    config: RetrievalConfig,
}

impl Retriever {
    /// Builds a retriever with its own candidate cache over `store`.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        config: RetrievalConfig,
    ) -> Self {
        let cache = Arc::new(CandidateCache::new(
            Arc::clone(&store),
            config.cache_ttl(),
            config.max_candidates(),
            config.upstream_timeout(),
        ));
        Self::with_cache(embedder, store, cache, config)
    }

    /// Builds a retriever around a cache owned elsewhere.
    pub fn with_cache(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        cache: Arc<CandidateCache>,
        config: RetrievalConfig,
    ) -> Self {
        let resolver = DetailResolver::new(store, config.upstream_timeout());
        Self {
            embedder,
            cache,
            resolver,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CandidateCache> {
        &self.cache
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Runs one retrieval request.
    ///
    /// Zero winners is a successful result with an empty `context`.
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
    ) -> Result<RetrievalResult, RetrieveError> {
        let started = Instant::now();
        let partition = request
            .partition
            .as_deref()
            .map(str::trim)
            .filter(|partition| !partition.is_empty())
            .unwrap_or(self.config.default_partition())
            .to_string();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(failed(
                Stage::Validate,
                &partition,
                RetrieveError::ValidationFailed("query text must not be empty".to_string()),
            ));
        }
        let top_k = self.config.effective_top_k(request.top_k);
        let mut timings = StageTimings::default();

        let stage_start = Instant::now();
        let query_vector = self
            .embed(query)
            .await
            .map_err(|err| failed(Stage::Embed, &partition, err.into()))?;
        timings.embed_ms = elapsed_ms(stage_start);

        let stage_start = Instant::now();
        let load = self.load_candidates(&partition).await?;
        timings.candidates_ms = elapsed_ms(stage_start);

        let stage_start = Instant::now();
        let ranking = score(
            &query_vector,
            &load.entries,
            self.config.similarity_floor(),
            top_k,
            self.config.max_top_k(),
        );
        timings.score_ms = elapsed_ms(stage_start);

        let stage_start = Instant::now();
        let mut details = self
            .resolver
            .resolve(&ranking.winners)
            .await
            .map_err(|err| failed(Stage::Hydrate, &partition, err.into()))?;
        timings.hydrate_ms = elapsed_ms(stage_start);

        let chunks: Vec<RetrievedChunk> = ranking
            .winners
            .into_iter()
            .filter_map(|winner| {
                let detail = details.remove(&winner.id)?;
                Some(RetrievedChunk::hydrate(winner, detail))
            })
            .collect();
        let context = build_context(&chunks);
        timings.total_ms = elapsed_ms(started);

        let meta = RetrievalMeta {
            partition,
            scanned: load.entries.len(),
            kept: ranking.kept,
            returned: chunks.len(),
            top_k,
            similarity_floor: self.config.similarity_floor(),
            cache: load.status,
            timings,
        };
        info!(
            query = %preview(query),
            partition = %meta.partition,
            top_k,
            scanned = meta.scanned,
            kept = meta.kept,
            returned = meta.returned,
            cache = meta.cache.as_str(),
            embed_ms = timings.embed_ms,
            candidates_ms = timings.candidates_ms,
            score_ms = timings.score_ms,
            hydrate_ms = timings.hydrate_ms,
            total_ms = timings.total_ms,
            "retrieval complete"
        );
        Ok(RetrievalResult {
            context,
            chunks,
            meta,
        })
    }

    async fn embed(&self, query: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
        let timeout = self.config.upstream_timeout();
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(EmbeddingError::unavailable(format!(
                "embedding task failed: {join}"
            ))),
            Err(_) => Err(EmbeddingError::unavailable(format!(
                "embedding timed out after {timeout:?}"
            ))),
        }
    }

    async fn load_candidates(&self, partition: &str) -> Result<CandidateLoad, RetrieveError> {
        match self.cache.get(partition).await {
            Ok(load) => Ok(load),
            Err(err) => {
                if self.config.serve_stale_on_error() {
                    if let Some(stale) = self.cache.get_stale(partition).await {
                        warn!(
                            partition,
                            error = %err,
                            age_secs = stale.age.as_secs(),
                            "serving stale candidates after failed refresh"
                        );
                        return Ok(stale);
                    }
                }
                Err(failed(Stage::LoadCandidates, partition, err.into()))
            }
        }
    }
}

fn failed(stage: Stage, partition: &str, err: RetrieveError) -> RetrieveError {
    match &err {
        RetrieveError::UpstreamFailed(cause) => {
            error!(stage = stage.as_str(), partition, error = %cause, "retrieval failed");
        }
        RetrieveError::ValidationFailed(reason) => {
            warn!(stage = stage.as_str(), partition, reason = %reason, "request rejected");
        }
    }
    err
}

/// Concatenates headers and quoted content in ranked order.
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| format!("{}\n\"{}\"", chunk.header(), chunk.content))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

fn preview(query: &str) -> String {
    let mut chars = query.chars();
    let head: String = chars.by_ref().take(QUERY_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
