use crate::types::RegionPartitionTarget;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Upper bound imposed by the market API on ids per request.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("batch_size must be between 1 and 100, got {0}")]
    InvalidBatchSize(usize),

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("attempt_timeout_secs must be greater than 0")]
    InvalidAttemptTimeout,

    #[error("schedule interval must be greater than 0")]
    InvalidInterval,

    #[error("listings must be greater than 0")]
    InvalidListings,

    #[error("at least one region must be configured")]
    NoRegions,

    #[error("empty region name")]
    EmptyRegionName,

    #[error("duplicate region name: {0}")]
    DuplicateRegion(String),

    #[error("region {0} has no partitions")]
    NoPartitions(String),

    #[error("empty partition name in region {0}")]
    EmptyPartitionName(String),

    #[error("port cannot be 0")]
    InvalidPort,

    #[error("store connection string cannot be empty")]
    EmptyConnectionString,
}

/// Market API settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Base URL of the market API, e.g. `https://universalis.app/api/v2/`
    pub base_url: Url,
    /// Number of listings requested per item.
    #[serde(default = "default_listings")]
    pub listings: u32,
}

fn default_listings() -> u32 {
    50
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Backoff grows linearly: attempt `n` waits `n * base_delay_ms` plus jitter.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CatalogConfig {
    /// Delimited file listing the item ids to sync.
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// Document database, one database per region.
    Mongodb { connection_string: String },
    /// One JSON document file per collection under `base_dir/<region>/`.
    Filesystem { base_dir: PathBuf },
    /// Process-local store, contents are lost on exit.
    Memory,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RegionConfig {
    /// Storage database name, e.g. "NA".
    pub name: String,
    /// Partition names queried against the market API, e.g. data center names.
    pub partitions: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    45 * 60
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            interval_secs: default_interval_secs(),
        }
    }
}

/// What a run does once a partition has failed after all retries.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop the run; the next scheduled run starts over from the first batch.
    #[default]
    Halt,
    /// Commit the partitions that succeeded and continue with the next batch.
    Skip,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub catalog: CatalogConfig,
    pub store: StoreConfig,
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub on_partition_failure: FailureMode,
    /// Serves /health and /ready when set.
    pub admin_listener: Option<Listener>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.catalog.batch_size == 0 || self.catalog.batch_size > MAX_BATCH_SIZE {
            return Err(ValidationError::InvalidBatchSize(self.catalog.batch_size));
        }

        if self.api.listings == 0 {
            return Err(ValidationError::InvalidListings);
        }

        if self.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }

        if self.retry.attempt_timeout_secs == 0 {
            return Err(ValidationError::InvalidAttemptTimeout);
        }

        if self.schedule.interval_secs == 0 {
            return Err(ValidationError::InvalidInterval);
        }

        if let StoreConfig::Mongodb { connection_string } = &self.store {
            if connection_string.trim().is_empty() {
                return Err(ValidationError::EmptyConnectionString);
            }
        }

        if self.regions.is_empty() {
            return Err(ValidationError::NoRegions);
        }

        let mut region_names = HashSet::new();
        for region in &self.regions {
            if region.name.is_empty() {
                return Err(ValidationError::EmptyRegionName);
            }

            if !region_names.insert(&region.name) {
                return Err(ValidationError::DuplicateRegion(region.name.clone()));
            }

            if region.partitions.is_empty() {
                return Err(ValidationError::NoPartitions(region.name.clone()));
            }

            if region.partitions.iter().any(|p| p.is_empty()) {
                return Err(ValidationError::EmptyPartitionName(region.name.clone()));
            }
        }

        if let Some(listener) = &self.admin_listener {
            listener.validate()?;
        }

        Ok(())
    }

    /// Flattens the region table into one target per (region, partition), in config order.
    pub fn targets(&self) -> Vec<RegionPartitionTarget> {
        self.regions
            .iter()
            .flat_map(|region| {
                region
                    .partitions
                    .iter()
                    .map(|partition| RegionPartitionTarget::new(&region.name, partition))
            })
            .collect()
    }
}
