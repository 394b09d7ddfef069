//! Postgres + pgvector implementation of [`ChunkStore`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pgvector::Vector;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::error;

use super::ChunkStore;
use crate::chunk::{CandidateEntry, ChunkDetail, ChunkPatch};
use crate::error::StoreError;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Index name for the partition-key btree index.
    pub fn partition_index_name(&self) -> String {
        format!(
            "{}_{}_source_file_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

struct Statements {
    candidates: String,
    details: String,
    merge: String,
    ids: String,
}

impl Statements {
    fn for_table(table: &TableName) -> Self {
        let qualified = table.qualified();
        Self {
            candidates: format!(
                "SELECT id, embedding FROM {qualified} \
                 WHERE source_file = $1 AND embedding IS NOT NULL \
                 LIMIT $2"
            ),
            details: format!(
                "SELECT id, content, page_number, chapter_title, source_file \
                 FROM {qualified} WHERE id = ANY($1)"
            ),
            merge: format!(
                "UPDATE {qualified} SET \
                    source_file = COALESCE($2, source_file), \
                    embedding = COALESCE($3, embedding), \
                    page_number = COALESCE($4, page_number), \
                    chapter_title = COALESCE($5, chapter_title) \
                 WHERE id = $1"
            ),
            ids: format!("SELECT id FROM {qualified} WHERE source_file = $1"),
        }
    }
}

/// Chunk store over a single pgvector table.
#[derive(Clone)]
pub struct PgChunkStore {
    client: Arc<Client>,
    table: TableName,
    sql: Arc<Statements>,
}

impl PgChunkStore {
    /// Connects and spawns the connection driver onto the current runtime.
    pub async fn connect(database_url: &str, table: TableName) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to Postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self::from_client(client, table))
    }

    pub fn from_client(client: Client, table: TableName) -> Self {
        let sql = Arc::new(Statements::for_table(&table));
        Self {
            client: Arc::new(client),
            table,
            sql,
        }
    }

    /// Creates the extension, table and partition index when missing.
    pub async fn prepare(&self, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        self.client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .context("failed to ensure pgvector extension")?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                embedding VECTOR({dims}),
                page_number INTEGER,
                chapter_title TEXT,
                source_file TEXT NOT NULL
            )",
            self.table.qualified()
        );
        self.client
            .execute(&ddl, &[])
            .await
            .context("failed to create chunk table")?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (source_file)",
            self.table.partition_index_name(),
            self.table.qualified()
        );
        self.client
            .execute(&index, &[])
            .await
            .context("failed to ensure source_file index")?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    async fn candidates(
        &self,
        partition: &str,
        limit: usize,
    ) -> Result<Vec<CandidateEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(self.sql.candidates.as_str(), &[&partition, &limit])
            .await
            .map_err(|err| classify("candidates", err))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(decode_error)?;
            let embedding: Vector = row.try_get("embedding").map_err(decode_error)?;
            out.push(CandidateEntry {
                id,
                embedding: embedding.to_vec(),
            });
        }
        Ok(out)
    }

    async fn fetch_details(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkDetail>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .client
            .query(self.sql.details.as_str(), &[&ids])
            .await
            .map_err(|err| classify("fetch_details", err))?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let detail = detail_from_row(&row).map_err(decode_error)?;
            out.insert(detail.id.clone(), detail);
        }
        Ok(out)
    }

    async fn merge(&self, id: &str, patch: &ChunkPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Err(StoreError::Rejected {
                reason: format!("empty patch for {id}"),
            });
        }
        let embedding = patch.embedding.clone().map(Vector::from);
        let updated = self
            .client
            .execute(
                self.sql.merge.as_str(),
                &[
                    &id,
                    &patch.source_file,
                    &embedding,
                    &patch.page_number,
                    &patch.chapter_title,
                ],
            )
            .await
            .map_err(|err| classify_write(id, err))?;
        if updated == 0 {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn ids_in_partition(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .client
            .query(self.sql.ids.as_str(), &[&partition])
            .await
            .map_err(|err| classify("ids_in_partition", err))?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(decode_error))
            .collect()
    }
}

fn detail_from_row(row: &Row) -> Result<ChunkDetail, tokio_postgres::Error> {
    Ok(ChunkDetail {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        page_number: row.try_get("page_number")?,
        chapter_title: row.try_get("chapter_title")?,
        source_file: row.try_get("source_file")?,
    })
}

fn decode_error(err: tokio_postgres::Error) -> StoreError {
    StoreError::Rejected {
        reason: format!("undecodable row: {err}"),
    }
}

fn is_contention(code: &SqlState) -> bool {
    *code == SqlState::T_R_SERIALIZATION_FAILURE
        || *code == SqlState::T_R_DEADLOCK_DETECTED
        || *code == SqlState::LOCK_NOT_AVAILABLE
        || *code == SqlState::QUERY_CANCELED
}

/// Connection exceptions (class 08), resource exhaustion on connect and
/// server shutdowns: the request never ran and may succeed later.
fn is_unavailable(code: &SqlState) -> bool {
    code.code().starts_with("08")
        || *code == SqlState::TOO_MANY_CONNECTIONS
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
}

fn classify(operation: &str, err: tokio_postgres::Error) -> StoreError {
    if err.is_closed() || err.code().map_or(true, is_unavailable) {
        return StoreError::unavailable(format!("{operation}: {err}"));
    }
    StoreError::Rejected {
        reason: format!("{operation}: {err}"),
    }
}

fn classify_write(id: &str, err: tokio_postgres::Error) -> StoreError {
    match err.code() {
        Some(code) if is_contention(code) => StoreError::Contention {
            id: id.to_string(),
            reason: err.to_string(),
        },
        _ => classify("merge", err),
    }
}
