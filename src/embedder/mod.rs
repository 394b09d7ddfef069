//! Query embedding clients.

pub mod openai;

use crate::error::EmbeddingError;

/// Converts text into a fixed-dimension vector.
///
/// Implementations make exactly one outbound call per invocation and never
/// retry; callers decide retry policy. Calls block, so async callers should
/// run them on the blocking pool.
pub trait Embedder: Send + Sync {
    /// Embeds a single query string.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}
