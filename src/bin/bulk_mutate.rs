use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use corpusrag::config::PipelineArgs;
use corpusrag::store::{PgChunkStore, TableName};
use corpusrag::telemetry::init_tracing;
use corpusrag::{BulkMutationPipeline, ChunkPatch, RecordBatch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "corpusrag-bulk",
    about = "Apply one metadata mutation across many chunks with bounded concurrency"
)]
struct BulkCli {
    /// Postgres connection string (postgres://...).
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Schema holding the chunk table.
    #[arg(long, env = "CORPUSRAG_SCHEMA", default_value = "public")]
    schema: String,

    /// Table storing chunks and their embeddings.
    #[arg(long, env = "CORPUSRAG_TABLE", default_value = "chunks")]
    table: String,

    /// JSONL file with one `{id, ...fields}` patch per line.
    #[arg(long, conflicts_with = "rename_from", required_unless_present = "rename_from")]
    input: Option<PathBuf>,

    /// Select every chunk in this partition from the store.
    #[arg(long, requires = "rename_to")]
    rename_from: Option<String>,

    /// New `source_file` written to every selected chunk.
    #[arg(long, requires = "rename_from")]
    rename_to: Option<String>,

    /// Enable debug logging when RUST_LOG is unset.
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BulkCli::parse();
    init_tracing(cli.verbose)?;

    let config = cli
        .pipeline
        .build_config()
        .context("invalid pipeline configuration")?;
    let table = TableName::new(cli.schema, cli.table)?;
    let store = PgChunkStore::connect(&cli.database_url, table)
        .await
        .with_context(|| format!("failed to open chunk store at {}", cli.database_url))?;

    let batch = match (&cli.input, &cli.rename_from, &cli.rename_to) {
        (Some(path), _, _) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            RecordBatch::from_jsonl(BufReader::new(file))
                .with_context(|| format!("failed to read {}", path.display()))?
        }
        (None, Some(from), Some(to)) => {
            if from == to {
                bail!("--rename-from and --rename-to name the same partition");
            }
            RecordBatch::from_partition(&store, from, ChunkPatch::rename_source(to.as_str()))
                .await
                .with_context(|| format!("failed to list chunks in partition {from}"))?
        }
        _ => bail!("either --input or --rename-from/--rename-to is required"),
    };
    if batch.is_empty() {
        warn!(skipped = batch.skipped, "no records selected; nothing to do");
        return Ok(());
    }

    let pipeline = BulkMutationPipeline::new(Arc::new(store), config);
    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; letting in-flight writes settle");
            cancel.cancel();
        }
    });

    let report = pipeline.run(batch).await;
    println!(
        "total={} submitted={} succeeded={} permanently_failed={} retries={} skipped={} not_submitted={} cancelled={} dry_run={} elapsed={:.1}s",
        report.total,
        report.submitted,
        report.succeeded,
        report.permanently_failed,
        report.retries,
        report.skipped,
        report.not_submitted,
        report.cancelled,
        report.dry_run,
        report.elapsed.as_secs_f64(),
    );
    if !report.dry_run && report.succeeded > 0 {
        info!("retrievers serve cached candidates until their TTL lapses; POST /v1/cache/invalidate to pick up changes now");
    }
    if report.permanently_failed > 0 {
        bail!("{} records permanently failed", report.permanently_failed);
    }
    Ok(())
}
