pub mod catalog;
pub mod config;
pub mod extractor;
pub mod fetcher;
pub mod metrics_defs;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod types;

use catalog::{CatalogError, ItemCatalog};
use config::{CatalogConfig, Config, StoreConfig, ValidationError};
use fetcher::{FetchError, MarketDataFetcher};
use pipeline::{BatchReport, IngestionPipeline, RunOutcome};
use retry::RetryPolicy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use store::{DocumentStore, FilesystemStore, MarketStore, MemoryStore, MongoStore, StoreFailure};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use types::RegionPartitionTarget;

#[derive(thiserror::Error, Debug)]
pub enum IngestorError {
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("could not build market API client: {0}")]
    Client(#[from] FetchError),
    #[error("could not set up the document store: {0}")]
    Store(#[from] StoreFailure),
}

/// Wires the pipeline together from configuration and runs it once or on a schedule.
pub struct Ingestor {
    pipeline: IngestionPipeline,
    store: MarketStore,
    targets: Vec<RegionPartitionTarget>,
    catalog: CatalogConfig,
    interval: Duration,
    ready: Arc<AtomicBool>,
}

impl Ingestor {
    pub async fn new(config: &Config) -> Result<Self, IngestorError> {
        config.validate()?;

        let policy = RetryPolicy::from_config(&config.retry);
        let fetcher = MarketDataFetcher::from_config(&config.api, policy)?;

        let backend: Arc<dyn DocumentStore> = match &config.store {
            StoreConfig::Mongodb { connection_string } => {
                Arc::new(MongoStore::connect(connection_string).await?)
            }
            StoreConfig::Filesystem { base_dir } => Arc::new(FilesystemStore::new(base_dir)),
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
        };
        let store = MarketStore::new(backend);

        Ok(Ingestor {
            pipeline: IngestionPipeline::new(fetcher, store.clone(), config.on_partition_failure),
            store,
            targets: config.targets(),
            catalog: config.catalog.clone(),
            interval: Duration::from_secs(config.schedule.interval_secs),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &MarketStore {
        &self.store
    }

    /// Set once a run has gone through the whole catalog.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Loads the catalog and runs the pipeline over it once. The catalog is re-read on
    /// every run so edits are picked up by the next tick.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<BatchReport, IngestorError> {
        let catalog = ItemCatalog::load(&self.catalog.path).await?;
        tracing::info!(
            items = catalog.len(),
            targets = self.targets.len(),
            "Starting ingestion run"
        );

        let batches = catalog.into_batches(self.catalog.batch_size);
        let report = self.pipeline.run_once(&batches, &self.targets, cancel).await;

        if report.outcome == RunOutcome::Completed {
            self.ready.store(true, Ordering::Relaxed);
        }

        Ok(report)
    }

    /// Runs immediately and then on every interval tick until `cancel` fires. Runs are
    /// awaited inline, so a slow run delays the next tick instead of overlapping it.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.run_once(&cancel).await {
                Ok(report) if !report.is_complete() => {
                    tracing::warn!(
                        batches_succeeded = report.batches_succeeded,
                        batches_total = report.batches_total,
                        "Ingestion run incomplete, next run starts from the first batch"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Ingestion run failed"),
            }
        }

        tracing::info!("Ingestion scheduler stopped");
    }
}
