use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use corpusrag::config::RetrievalArgs;
use corpusrag::embedder::openai::OpenAiEmbedder;
use corpusrag::store::{PgChunkStore, TableName};
use corpusrag::telemetry::init_tracing;
use corpusrag::{router, AppState, Retriever};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "corpusrag-retriever",
    about = "HTTP API serving cosine retrieval over the reference corpus"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "CORPUSRAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the chunk table.
    #[arg(long, env = "CORPUSRAG_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing chunks and their embeddings.
    #[arg(long, env = "CORPUSRAG_TABLE", default_value = "chunks")]
    table: String,

    /// Create the pgvector extension, table and partition index before serving.
    #[arg(long)]
    prepare_schema: bool,

    /// OpenAI API key used for query embeddings.
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: String,

    /// Embedding model identifier.
    #[arg(
        long,
        env = "CORPUSRAG_OPENAI_MODEL",
        default_value = "text-embedding-3-small"
    )]
    openai_model: String,

    /// Optional embedding dimension override.
    #[arg(long, env = "CORPUSRAG_OPENAI_DIMENSIONS")]
    openai_dimensions: Option<usize>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(
        long,
        env = "CORPUSRAG_OPENAI_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    openai_base_url: String,

    /// Enable debug logging when RUST_LOG is unset.
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ApiCli::parse();
    init_tracing(cli.verbose)?;

    let config = cli
        .retrieval
        .build_config()
        .context("invalid retrieval configuration")?;
    let table = TableName::new(cli.schema, cli.table)?;
    let store = PgChunkStore::connect(&cli.database_url, table)
        .await
        .with_context(|| format!("failed to open chunk store at {}", cli.database_url))?;
    if cli.prepare_schema {
        store
            .prepare(cli.openai_dimensions.unwrap_or(1536))
            .await?;
    }

    let embedder = OpenAiEmbedder::build(
        cli.openai_api_key,
        cli.openai_base_url,
        cli.openai_model,
        cli.openai_dimensions,
        config.upstream_timeout(),
    )
    .await?;
    info!(
        endpoint = embedder.endpoint(),
        partition = config.default_partition(),
        top_k = config.default_top_k(),
        max_top_k = config.max_top_k(),
        floor = config.similarity_floor(),
        cache_ttl_secs = config.cache_ttl().as_secs(),
        "retriever configured"
    );

    let retriever = Retriever::new(Arc::new(embedder), Arc::new(store), config);
    let app = router(AppState::new(Arc::new(retriever)));

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "corpusrag-retriever listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
