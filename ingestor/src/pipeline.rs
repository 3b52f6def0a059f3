//! Drives one ingestion run: batches are processed strictly in order, the partitions of a
//! batch are fetched concurrently, and the batch is handed to the store only once every
//! partition has finished.

use crate::config::FailureMode;
use crate::extractor::{ExtractionError, PartitionResult, extract};
use crate::fetcher::{FetchError, MarketDataFetcher};
use crate::metrics_defs::{
    BATCH_FAILED, BATCH_SUCCEEDED, ITEMS_MALFORMED, ITEMS_MISSING, RUN_DURATION,
};
use crate::retry::{RetryError, Retryable};
use crate::store::{MarketStore, RegionResult, StoreError};
use crate::types::{Batch, ItemId, RegionPartitionTarget};
use shared::{counter, histogram};
use std::collections::HashSet;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Failure of a single fetch-then-extract attempt.
#[derive(thiserror::Error, Debug)]
pub enum AttemptFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not extract response: {0}")]
    Extract(ExtractionError),
}

impl Retryable for AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Fetch(e) => e.is_retryable(),
            // A truncated or garbled body is worth fetching again.
            AttemptFailure::Extract(ExtractionError::NoPartitionField)
            | AttemptFailure::Extract(ExtractionError::Malformed(_)) => true,
            AttemptFailure::Extract(ExtractionError::MalformedItem { .. }) => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PartitionError {
    #[error(transparent)]
    Retry(#[from] RetryError<AttemptFailure>),
    #[error("partition task failed: {0}")]
    Task(String),
}

#[derive(thiserror::Error, Debug)]
#[error(
    "{} / {} failed for batch {batch_index} (ids {first_id}..{last_id}): {error}",
    .target.region_name,
    .target.partition_query_name
)]
pub struct PartitionFailure {
    pub target: RegionPartitionTarget,
    pub batch_index: usize,
    pub first_id: ItemId,
    pub last_id: ItemId,
    #[source]
    pub error: PartitionError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every batch was attempted.
    Completed,
    /// A partition or store failure stopped the run early.
    Halted,
    Cancelled,
}

#[derive(Debug)]
pub struct BatchReport {
    pub batches_total: usize,
    pub batches_attempted: usize,
    pub batches_succeeded: usize,
    pub records_upserted: usize,
    pub partition_failures: Vec<PartitionFailure>,
    pub store_failure: Option<StoreError>,
    pub outcome: RunOutcome,
}

impl BatchReport {
    fn new(batches_total: usize) -> Self {
        BatchReport {
            batches_total,
            batches_attempted: 0,
            batches_succeeded: 0,
            records_upserted: 0,
            partition_failures: Vec::new(),
            store_failure: None,
            outcome: RunOutcome::Completed,
        }
    }

    /// True when every batch was fetched for every partition and committed.
    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.batches_succeeded == self.batches_total
    }
}

type PartitionOutcome = Result<PartitionResult, PartitionError>;

pub struct IngestionPipeline {
    fetcher: MarketDataFetcher,
    store: MarketStore,
    failure_mode: FailureMode,
}

impl IngestionPipeline {
    pub fn new(fetcher: MarketDataFetcher, store: MarketStore, failure_mode: FailureMode) -> Self {
        IngestionPipeline {
            fetcher,
            store,
            failure_mode,
        }
    }

    /// Processes `batches` in order against every target. Never fails: all partition and
    /// store errors end up in the returned report.
    pub async fn run_once(
        &self,
        batches: &[Batch],
        targets: &[RegionPartitionTarget],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport::new(batches.len());

        for batch in batches {
            if cancel.is_cancelled() {
                report.outcome = RunOutcome::Cancelled;
                break;
            }

            report.batches_attempted += 1;
            let (results, failures) = self.fetch_batch(batch, targets, cancel).await;

            if cancel.is_cancelled() {
                report.outcome = RunOutcome::Cancelled;
                break;
            }

            for failure in &failures {
                tracing::error!(
                    region = %failure.target.region_name,
                    partition = %failure.target.partition_query_name,
                    batch = batch.index,
                    first_id = %failure.first_id,
                    last_id = %failure.last_id,
                    error = %failure.error,
                    "Partition failed after retries"
                );
            }

            let batch_failed = !failures.is_empty();
            report.partition_failures.extend(failures);

            if batch_failed && self.failure_mode == FailureMode::Halt {
                counter!(BATCH_FAILED).increment(1);
                report.outcome = RunOutcome::Halted;
                break;
            }

            let upserted = tokio::select! {
                _ = cancel.cancelled() => {
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
                upserted = self.store.upsert_all(&results) => upserted,
            };

            match upserted {
                Ok(summary) => {
                    report.records_upserted += summary.records;
                    if batch_failed {
                        counter!(BATCH_FAILED).increment(1);
                    } else {
                        counter!(BATCH_SUCCEEDED).increment(1);
                        report.batches_succeeded += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        batch = batch.index,
                        first_id = batch.first_id().unwrap_or_default(),
                        last_id = batch.last_id().unwrap_or_default(),
                        error = %e,
                        "Failed to commit batch"
                    );
                    counter!(BATCH_FAILED).increment(1);
                    report.store_failure = Some(e);
                    report.outcome = RunOutcome::Halted;
                    break;
                }
            }
        }

        histogram!(RUN_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            batches_total = report.batches_total,
            batches_attempted = report.batches_attempted,
            batches_succeeded = report.batches_succeeded,
            records_upserted = report.records_upserted,
            outcome = ?report.outcome,
            "Ingestion run finished"
        );

        report
    }

    /// Fetches and extracts one batch for every target concurrently. Successful results
    /// come back in target order.
    async fn fetch_batch(
        &self,
        batch: &Batch,
        targets: &[RegionPartitionTarget],
        cancel: &CancellationToken,
    ) -> (Vec<RegionResult>, Vec<PartitionFailure>) {
        let mut join_set = JoinSet::new();

        for (position, target) in targets.iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let target = target.clone();
            let ids = batch.ids.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let outcome = fetch_partition(&fetcher, &target, &ids, &cancel).await;
                (position, outcome)
            });
        }

        let mut outcomes: Vec<(usize, PartitionOutcome)> = Vec::with_capacity(targets.len());
        let mut pending: HashSet<usize> = (0..targets.len()).collect();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((position, outcome)) => {
                    pending.remove(&position);
                    outcomes.push((position, outcome));
                }
                Err(e) => tracing::error!("Partition task panicked: {}", e),
            }
        }

        // Tasks that never reported back.
        for position in pending {
            outcomes.push((
                position,
                Err(PartitionError::Task("task did not complete".to_string())),
            ));
        }

        outcomes.sort_by_key(|(position, _)| *position);

        let mut results = Vec::new();
        let mut failures = Vec::new();

        for (position, outcome) in outcomes {
            let target = &targets[position];
            match outcome {
                Ok(partition) => {
                    log_partition(batch, target, &partition);
                    results.push(RegionResult {
                        region_name: target.region_name.clone(),
                        partition,
                    });
                }
                Err(error) => failures.push(PartitionFailure {
                    target: target.clone(),
                    batch_index: batch.index,
                    first_id: batch.first_id().unwrap_or_default().to_string(),
                    last_id: batch.last_id().unwrap_or_default().to_string(),
                    error,
                }),
            }
        }

        (results, failures)
    }
}

/// One fetch followed by extraction, the pair retried as a unit.
async fn fetch_partition(
    fetcher: &MarketDataFetcher,
    target: &RegionPartitionTarget,
    ids: &[ItemId],
    cancel: &CancellationToken,
) -> PartitionOutcome {
    let partition = target.partition_query_name.as_str();

    let result = fetcher
        .fetch_with(partition, ids, cancel, |raw| {
            extract(&raw, ids).map_err(AttemptFailure::Extract)
        })
        .await?;

    Ok(result)
}

fn log_partition(batch: &Batch, target: &RegionPartitionTarget, partition: &PartitionResult) {
    for error in &partition.item_errors {
        tracing::warn!(
            region = %target.region_name,
            partition = %partition.partition_name,
            batch = batch.index,
            error = %error,
            "Skipping malformed item"
        );
    }

    let missing = partition.missing_ids().len();
    counter!(ITEMS_MALFORMED).increment(partition.item_errors.len() as u64);
    counter!(ITEMS_MISSING).increment(missing as u64);

    tracing::debug!(
        region = %target.region_name,
        query = %target.partition_query_name,
        partition = %partition.partition_name,
        batch = batch.index,
        records = partition.records.len(),
        missing,
        "Partition extracted"
    );
}
