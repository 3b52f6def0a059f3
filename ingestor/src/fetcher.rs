use crate::config::ApiConfig;
use crate::metrics_defs::{FETCH_DURATION, FETCH_FAILED};
use crate::retry::{RetryError, RetryPolicy, Retryable};
use crate::types::ItemId;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use shared::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fields requested from the market API. `dcName` and `worldName` resolve the partition.
pub const DEFAULT_FIELDS: &[&str] = &[
    "items.listings.pricePerUnit",
    "items.averagePrice",
    "items.unitsSold",
    "items.listings.worldName",
    "dcName",
    "worldName",
];

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("market API returned {0}")]
    Status(StatusCode),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::InvalidUrl(_) => false,
            FetchError::Transport(e) => !e.is_builder(),
            FetchError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// Issues market data requests for one partition and a batch of items.
#[derive(Clone)]
pub struct MarketDataFetcher {
    client: reqwest::Client,
    base_url: Url,
    listings: u32,
    fields: Vec<String>,
    policy: RetryPolicy,
}

impl MarketDataFetcher {
    pub fn new(client: reqwest::Client, base_url: Url, listings: u32, policy: RetryPolicy) -> Self {
        MarketDataFetcher {
            client,
            base_url,
            listings,
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            policy,
        }
    }

    pub fn from_config(config: &ApiConfig, policy: RetryPolicy) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("market-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::new(
            client,
            config.base_url.clone(),
            config.listings,
            policy,
        ))
    }

    /// `{base}/{partition}/{id,id,...}?listings={n}&fields={field,field,...}`
    pub fn request_url(&self, partition: &str, ids: &[ItemId]) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();

        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push(partition)
            .push(&ids.join(","));

        url.query_pairs_mut()
            .append_pair("listings", &self.listings.to_string())
            .append_pair("fields", &self.fields.join(","));

        Ok(url)
    }

    /// A single request without retries. Any non-2xx status is an error.
    pub async fn fetch_once(&self, partition: &str, ids: &[ItemId]) -> Result<Bytes, FetchError> {
        let url = self.request_url(partition, ids)?;
        let started = Instant::now();

        let result = async {
            let response = self.client.get(url).send().await?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status));
            }

            Ok(response.bytes().await?)
        }
        .await;

        histogram!(FETCH_DURATION).record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            counter!(FETCH_FAILED).increment(1);
            tracing::debug!(partition, error = %e, "Market data request failed");
        }

        result
    }

    /// Fetches under the retry policy.
    pub async fn fetch(
        &self,
        partition: &str,
        ids: &[ItemId],
        cancel: &CancellationToken,
    ) -> Result<Bytes, RetryError<FetchError>> {
        self.fetch_with(partition, ids, cancel, Ok).await
    }

    /// Fetches and decodes under the retry policy. The request and `decode` form a single
    /// attempt, so a body that fails to decode is re-requested when the error is retryable.
    pub async fn fetch_with<T, E, F>(
        &self,
        partition: &str,
        ids: &[ItemId],
        cancel: &CancellationToken,
        decode: F,
    ) -> Result<T, RetryError<E>>
    where
        F: Fn(Bytes) -> Result<T, E>,
        E: From<FetchError> + Retryable + std::fmt::Display,
    {
        let decode = &decode;
        self.policy
            .run(cancel, partition, move |_| async move {
                self.fetch_once(partition, ids)
                    .await
                    .map_err(E::from)
                    .and_then(decode)
            })
            .await
    }
}
