//! Corpus records and the projections of them that flow through retrieval.

use serde::{Deserialize, Serialize};

/// Full corpus record as written by the ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable, unique chunk identifier.
    pub id: String,
    /// Passage text.
    pub content: String,
    /// Precomputed embedding of `content`.
    pub embedding: Vec<f32>,
    /// Page the passage starts on, when the source is paginated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i32>,
    /// Chapter heading the passage sits under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
    /// Source document name; doubles as the partition key.
    pub source_file: String,
}

impl Chunk {
    /// Slim `(id, embedding)` projection held by the candidate cache.
    pub fn to_candidate(&self) -> CandidateEntry {
        CandidateEntry {
            id: self.id.clone(),
            embedding: self.embedding.clone(),
        }
    }

    /// Hydrated projection without the vector.
    pub fn to_detail(&self) -> ChunkDetail {
        ChunkDetail {
            id: self.id.clone(),
            content: self.content.clone(),
            page_number: self.page_number,
            chapter_title: self.chapter_title.clone(),
            source_file: self.source_file.clone(),
        }
    }

    /// Applies a merge patch in place; absent fields stay untouched.
    pub fn apply(&mut self, patch: &ChunkPatch) {
        if let Some(source_file) = &patch.source_file {
            self.source_file = source_file.clone();
        }
        if let Some(embedding) = &patch.embedding {
            self.embedding = embedding.clone();
        }
        if let Some(page_number) = patch.page_number {
            self.page_number = Some(page_number);
        }
        if let Some(chapter_title) = &patch.chapter_title {
            self.chapter_title = Some(chapter_title.clone());
        }
    }
}

/// Compact candidate used for brute-force scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntry {
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Content and metadata fetched for a winning candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDetail {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
    pub source_file: String,
}

/// Merge patch over the metadata fields the bulk pipeline may rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_title: Option<String>,
}

impl ChunkPatch {
    /// Patch that moves a record into another partition.
    pub fn rename_source(source_file: impl Into<String>) -> Self {
        Self {
            source_file: Some(source_file.into()),
            ..Self::default()
        }
    }

    /// Patch that replaces a record's embedding.
    pub fn set_embedding(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
            ..Self::default()
        }
    }

    /// True when no field would change.
    pub fn is_empty(&self) -> bool {
        self.source_file.is_none()
            && self.embedding.is_none()
            && self.page_number.is_none()
            && self.chapter_title.is_none()
    }
}

/// One unit of work for the bulk mutation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    #[serde(flatten)]
    pub patch: ChunkPatch,
}
