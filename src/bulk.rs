//! Bulk metadata mutation under a bounded admission window with retry.
//!
//! Records are shuffled, then written with at most `max_in_flight` merges
//! outstanding. A transient failure backs off and retries the same record;
//! anything else, or running out of attempts, fails that record and the
//! batch continues.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::backoff::{retry_with_backoff, RetryPolicy};
use crate::chunk::{ChunkPatch, MutationRecord};
use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::store::ChunkStore;

const DRY_RUN_SAMPLE: usize = 10;

/// Shared stop flag. Cancelling stops admissions; writes already in flight
/// still settle.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Records selected for one run plus how many input lines were dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub records: Vec<MutationRecord>,
    pub skipped: usize,
}

impl RecordBatch {
    /// Parses one `{id, ...patch fields}` object per line.
    ///
    /// Blank lines are ignored. Lines that are not valid records, lack an id,
    /// or carry no patch field are logged and counted in `skipped`.
    pub fn from_jsonl<R: BufRead>(reader: R) -> std::io::Result<Self> {
        let mut batch = Self::default();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let line_no = index + 1;
            match serde_json::from_str::<MutationRecord>(trimmed) {
                Ok(record) if record.id.trim().is_empty() => {
                    warn!(line = line_no, "record without id skipped");
                    batch.skipped += 1;
                }
                Ok(record) if record.patch.is_empty() => {
                    warn!(line = line_no, id = %record.id, "record without patch fields skipped");
                    batch.skipped += 1;
                }
                Ok(record) => batch.records.push(record),
                Err(err) => {
                    warn!(line = line_no, error = %err, "invalid record line skipped");
                    batch.skipped += 1;
                }
            }
        }
        Ok(batch)
    }

    /// Pairs every id in `partition` with the same patch.
    pub async fn from_partition(
        store: &dyn ChunkStore,
        partition: &str,
        patch: ChunkPatch,
    ) -> Result<Self, StoreError> {
        let ids = store.ids_in_partition(partition).await?;
        info!(partition, selected = ids.len(), "records selected from store");
        Ok(Self {
            records: ids
                .into_iter()
                .map(|id| MutationRecord {
                    id,
                    patch: patch.clone(),
                })
                .collect(),
            skipped: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Records handed to the run.
    pub total: usize,
    /// Records admitted to the window (attempted at least once).
    pub submitted: usize,
    pub succeeded: usize,
    pub permanently_failed: usize,
    /// Extra attempts beyond the first, summed over all records.
    pub retries: u64,
    /// Input lines dropped before the run.
    pub skipped: usize,
    /// Records never admitted because the run was cancelled.
    pub not_submitted: usize,
    pub cancelled: bool,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl PipelineReport {
    /// True when every submitted record was written and nothing was left behind.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.permanently_failed == 0 && self.succeeded == self.total
    }
}

struct WriteOutcome {
    id: String,
    attempts: u32,
    result: Result<(), StoreError>,
}

/// Applies [`MutationRecord`]s against a [`ChunkStore`].
pub struct BulkMutationPipeline {
    store: Arc<dyn ChunkStore>,
    config: PipelineConfig,
    cancel: CancelHandle,
}

impl BulkMutationPipeline {
    pub fn new(store: Arc<dyn ChunkStore>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Handle that stops this pipeline's admissions when cancelled.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the batch to completion (or cancellation) and reports the outcome.
    pub async fn run(&self, batch: RecordBatch) -> PipelineReport {
        let started = Instant::now();
        let RecordBatch {
            mut records,
            skipped,
        } = batch;
        let mut report = PipelineReport {
            total: records.len(),
            skipped,
            dry_run: self.config.dry_run(),
            ..PipelineReport::default()
        };

        match self.config.shuffle_seed() {
            Some(seed) => records.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => records.shuffle(&mut rand::thread_rng()),
        }

        if self.config.dry_run() {
            let sample: Vec<&str> = records
                .iter()
                .take(DRY_RUN_SAMPLE)
                .map(|record| record.id.as_str())
                .collect();
            info!(
                selected = report.total,
                skipped,
                sample = ?sample,
                "dry run; no writes issued"
            );
            report.elapsed = started.elapsed();
            return report;
        }

        info!(
            total = report.total,
            skipped,
            max_in_flight = self.config.max_in_flight(),
            max_attempts = self.config.retry().max_attempts(),
            "bulk mutation started"
        );

        let policy = *self.config.retry();
        let log_every = self.config.log_every().max(1);
        let mut pending = records.into_iter();
        let mut in_flight: JoinSet<WriteOutcome> = JoinSet::new();
        let mut completed = 0usize;

        loop {
            while in_flight.len() < self.config.max_in_flight() && !self.cancel.is_cancelled() {
                let Some(record) = pending.next() else {
                    break;
                };
                report.submitted += 1;
                in_flight.spawn(write_record(Arc::clone(&self.store), policy, record));
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            completed += 1;
            match joined {
                Ok(outcome) => {
                    report.retries += u64::from(outcome.attempts.saturating_sub(1));
                    match outcome.result {
                        Ok(()) => report.succeeded += 1,
                        Err(err) => {
                            report.permanently_failed += 1;
                            error!(
                                id = %outcome.id,
                                attempts = outcome.attempts,
                                error = %err,
                                "record permanently failed"
                            );
                        }
                    }
                }
                Err(err) => {
                    report.permanently_failed += 1;
                    error!(error = %err, "write task aborted");
                }
            }

            if completed % log_every == 0 {
                info!(
                    completed,
                    total = report.total,
                    succeeded = report.succeeded,
                    failed = report.permanently_failed,
                    retries = report.retries,
                    in_flight = in_flight.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "bulk mutation progress"
                );
            }
        }

        report.not_submitted = pending.len();
        report.cancelled = self.cancel.is_cancelled();
        report.elapsed = started.elapsed();
        if report.cancelled {
            warn!(
                submitted = report.submitted,
                not_submitted = report.not_submitted,
                "bulk mutation cancelled"
            );
        }
        info!(
            total = report.total,
            submitted = report.submitted,
            succeeded = report.succeeded,
            permanently_failed = report.permanently_failed,
            retries = report.retries,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "bulk mutation finished"
        );
        report
    }
}

async fn write_record(
    store: Arc<dyn ChunkStore>,
    policy: RetryPolicy,
    record: MutationRecord,
) -> WriteOutcome {
    let MutationRecord { id, patch } = record;
    let (store_ref, id_ref, patch_ref) = (store.as_ref(), id.as_str(), &patch);
    let outcome = retry_with_backoff(
        &policy,
        move |_| store_ref.merge(id_ref, patch_ref),
        StoreError::is_transient,
        |attempt, err, delay| {
            warn!(
                id = id_ref,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient write failure; backing off"
            );
        },
    )
    .await;
    WriteOutcome {
        id,
        attempts: outcome.attempts,
        result: outcome.result,
    }
}
