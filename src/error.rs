//! Error taxonomy shared by the retrieval path and the bulk mutation pipeline.

use std::time::Duration;

/// Failure raised by an [`Embedder`](crate::embedder::Embedder).
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Network failure, non-success status, or a malformed/empty payload.
    #[error("embedding service unavailable: {reason}")]
    Unavailable { reason: String },
}

impl EmbeddingError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Failure raised by a [`ChunkStore`](crate::store::ChunkStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the connection.
    #[error("document store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The operation did not finish before its deadline.
    #[error("document store {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// A write lost a race with a concurrent writer (aborted transaction,
    /// lock timeout, deadlock). Safe to retry.
    #[error("write contention on {id}: {reason}")]
    Contention { id: String, reason: String },

    /// The target record does not exist.
    #[error("record {id} not found")]
    NotFound { id: String },

    /// The store rejected the request outright; retrying will not help.
    #[error("request rejected: {reason}")]
    Rejected { reason: String },
}

impl StoreError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether a retry of the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Contention { .. }
        )
    }
}

/// Terminal failure of one retrieval request.
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    /// Malformed or empty input. A client error; never retried.
    #[error("{0}")]
    ValidationFailed(String),

    /// The embedding service or the document store failed. The source is kept
    /// for logging but never shown to callers.
    #[error("retrieval failed")]
    UpstreamFailed(#[source] UpstreamError),
}

/// Underlying cause of [`RetrieveError::UpstreamFailed`].
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EmbeddingError> for RetrieveError {
    fn from(err: EmbeddingError) -> Self {
        Self::UpstreamFailed(err.into())
    }
}

impl From<StoreError> for RetrieveError {
    fn from(err: StoreError) -> Self {
        Self::UpstreamFailed(err.into())
    }
}

/// Invalid static tunables.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("similarity floor {0} is outside [-1, 1]")]
    FloorOutOfRange(f32),

    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    #[error("backoff growth {0} must be >= 1.0")]
    GrowthTooSmall(f64),

    #[error("default partition must not be blank")]
    BlankPartition,
}
