//! OpenAI-compatible embedding client.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::Embedder;
use crate::error::EmbeddingError;

/// Blocking client for `POST {base}/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    /// Builds a new embeddings client. `timeout` bounds each request.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            dimensions,
        })
    }

    /// [`OpenAiEmbedder::new`] run on the blocking pool. The blocking client
    /// cannot be built on a runtime worker thread.
    pub async fn build(
        api_key: String,
        base_url: String,
        model: String,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            Self::new(api_key, base_url, model, dimensions, timeout)
        })
        .await
        .context("embedder construction task failed")?
    }

    /// Endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = [text];
        let request = EmbeddingRequest {
            model: &self.model,
            input: &input,
            dimensions: self.dimensions,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| EmbeddingError::unavailable(format!("request failed: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::unavailable(format!(
                "embeddings request failed ({status}): {body}"
            )));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .map_err(|err| EmbeddingError::unavailable(format!("undecodable payload: {err}")))?;
        first_vector(parsed, self.dimensions)
    }
}

fn first_vector(
    mut parsed: EmbeddingResponse,
    dimensions: Option<usize>,
) -> Result<Vec<f32>, EmbeddingError> {
    parsed.data.sort_by_key(|entry| entry.index);
    let vector = parsed
        .data
        .into_iter()
        .next()
        .map(|entry| entry.embedding)
        .ok_or_else(|| EmbeddingError::unavailable("response carried no embeddings"))?;
    if vector.is_empty() {
        return Err(EmbeddingError::unavailable("response carried an empty vector"));
    }
    if let Some(expected) = dimensions {
        if vector.len() != expected {
            return Err(EmbeddingError::unavailable(format!(
                "expected {expected} dimensions, got {}",
                vector.len()
            )));
        }
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(EmbeddingError::unavailable("response carried non-finite values"));
    }
    Ok(vector)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> EmbeddingResponse {
        serde_json::from_str(json).expect("fixture parses")
    }

    #[test]
    fn picks_lowest_index_vector() {
        let parsed = response(
            r#"{"data":[{"embedding":[9.0],"index":1},{"embedding":[0.5,0.5],"index":0}]}"#,
        );
        assert_eq!(first_vector(parsed, None).expect("vector"), vec![0.5, 0.5]);
    }

    #[test]
    fn empty_payloads_are_unavailable() {
        assert!(first_vector(response(r#"{"data":[]}"#), None).is_err());
        assert!(first_vector(response(r#"{"data":[{"embedding":[],"index":0}]}"#), None).is_err());
    }

    #[test]
    fn dimension_mismatch_is_unavailable() {
        let parsed = response(r#"{"data":[{"embedding":[0.1,0.2,0.3],"index":0}]}"#);
        let err = first_vector(parsed, Some(4)).expect_err("mismatch");
        assert!(err.to_string().contains("expected 4 dimensions"));
    }

    #[test]
    fn request_omits_absent_dimensions() {
        let input = ["hand hygiene"];
        let body = serde_json::to_value(EmbeddingRequest {
            model: "text-embedding-3-small",
            input: &input,
            dimensions: None,
        })
        .expect("serializes");
        assert_eq!(
            body,
            serde_json::json!({"model": "text-embedding-3-small", "input": ["hand hygiene"]})
        );
    }

    #[test]
    fn unreachable_endpoint_maps_to_unavailable() {
        let embedder = OpenAiEmbedder::new(
            "sk-test".into(),
            "http://127.0.0.1:9".into(),
            "text-embedding-3-small".into(),
            None,
            Duration::from_millis(200),
        )
        .expect("client builds");
        assert_eq!(embedder.endpoint(), "http://127.0.0.1:9/embeddings");
        assert!(matches!(
            embedder.embed("hello"),
            Err(EmbeddingError::Unavailable { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn builds_from_async_context() {
        let embedder = OpenAiEmbedder::build(
            "sk-test".into(),
            "http://127.0.0.1:9".into(),
            "text-embedding-3-small".into(),
            None,
            Duration::from_millis(100),
        )
        .await
        .expect("client builds");
        assert_eq!(embedder.endpoint(), "http://127.0.0.1:9/embeddings");

        let result = tokio::task::spawn_blocking(move || embedder.embed("hello"))
            .await
            .expect("embed task joins");
        assert!(matches!(result, Err(EmbeddingError::Unavailable { .. })));
    }
}
