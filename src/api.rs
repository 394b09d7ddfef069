//! HTTP surface over a shared [`Retriever`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RetrieveError;
use crate::retriever::{RetrievalRequest, RetrievalResult, Retriever};

/// Composition root handed to every handler.
#[derive(Clone)]
pub struct AppState {
    retriever: Arc<Retriever>,
}

impl AppState {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default, alias = "sourceFile")]
    pub partition: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub invalidated: String,
    pub evicted: usize,
}

type ApiError = (StatusCode, Json<ErrorBody>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/retrieve", post(retrieve_handler))
        .route("/v1/cache/invalidate", post(invalidate_handler))
        .with_state(state)
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn retrieve_handler(
    State(state): State<AppState>,
    payload: Result<Json<RetrievalRequest>, JsonRejection>,
) -> Result<Json<RetrievalResult>, ApiError> {
    let Json(request) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;
    match state.retriever.retrieve(&request).await {
        Ok(result) => Ok(Json(result)),
        Err(err @ RetrieveError::ValidationFailed(_)) => Err(bad_request(err.to_string())),
        Err(err @ RetrieveError::UpstreamFailed(_)) => Err(internal_error(err.to_string())),
    }
}

/// Evicts one partition, or every partition when the body names none.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let request: InvalidateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        InvalidateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| bad_request(format!("invalid invalidate request: {err}")))?
    };
    let cache = state.retriever.cache();
    let response = match request
        .partition
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        Some(partition) => InvalidateResponse {
            invalidated: partition.to_string(),
            evicted: usize::from(cache.invalidate(partition).await),
        },
        None => InvalidateResponse {
            invalidated: "*".to_string(),
            evicted: cache.invalidate_all().await,
        },
    };
    info!(
        partition = %response.invalidated,
        evicted = response.evicted,
        "candidate cache invalidated"
    );
    Ok(Json(response))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn internal_error(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::config::RetrievalConfig;
    use crate::embedder::Embedder;
    use crate::error::EmbeddingError;
    use crate::store::MemoryChunkStore;

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text == "offline" {
                return Err(EmbeddingError::unavailable("connection refused"));
            }
            Ok(vec![1.0, 0.0])
        }
    }

    fn state() -> (Arc<MemoryChunkStore>, AppState) {
        let store = Arc::new(MemoryChunkStore::from_chunks([Chunk {
            id: "p1".into(),
            content: "Check the water temperature.".into(),
            embedding: vec![1.0, 0.1],
            page_number: Some(210),
            chapter_title: Some("Bathing".into()),
            source_file: "manual".into(),
        }]));
        let retriever = Retriever::new(
            Arc::new(AxisEmbedder),
            store.clone(),
            RetrievalConfig::default().with_default_partition("manual"),
        );
        (store, AppState::new(Arc::new(retriever)))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retrieve_returns_ranked_chunks() {
        let (_, state) = state();
        let Json(result) = retrieve_handler(
            State(state),
            Ok(Json(RetrievalRequest::new("bath water"))),
        )
        .await
        .expect("success");
        assert_eq!(result.chunks.len(), 1);
        let body = serde_json::to_value(&result).expect("serializes");
        assert_eq!(body["meta"]["cache"], "miss");
        assert_eq!(body["meta"]["topK"], 5);
        assert_eq!(body["chunks"][0]["page_number"], 210);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blank_query_is_bad_request() {
        let (_, state) = state();
        let (status, Json(body)) =
            retrieve_handler(State(state), Ok(Json(RetrievalRequest::new(""))))
                .await
                .expect_err("validation");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "query text must not be empty");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn upstream_failure_is_generic_server_error() {
        let (_, state) = state();
        let (status, Json(body)) =
            retrieve_handler(State(state), Ok(Json(RetrievalRequest::new("offline"))))
                .await
                .expect_err("upstream");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "retrieval failed");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalidate_targets_one_or_all_partitions() {
        let (store, state) = state();
        retrieve_handler(State(state.clone()), Ok(Json(RetrievalRequest::new("q"))))
            .await
            .expect("populate");

        let Json(one) = invalidate_handler(
            State(state.clone()),
            Bytes::from_static(br#"{"partition":"manual"}"#),
        )
        .await
        .expect("invalidate");
        assert_eq!(one.invalidated, "manual");
        assert_eq!(one.evicted, 1);

        let Json(all) = invalidate_handler(State(state.clone()), Bytes::new())
            .await
            .expect("invalidate all");
        assert_eq!(all.invalidated, "*");
        assert_eq!(all.evicted, 0);

        retrieve_handler(State(state), Ok(Json(RetrievalRequest::new("q"))))
            .await
            .expect("repopulate");
        assert_eq!(store.stats().candidate_reads, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_invalidate_body_is_rejected() {
        let (_, state) = state();
        let (status, _) = invalidate_handler(State(state), Bytes::from_static(b"{nope"))
            .await
            .expect_err("bad json");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
