use std::time;

use crawl_common::channel::PublishError;
use crawl_common::dedup::StoreError;
use crawl_common::fetcher::FetchError;
use crawl_common::keys::EntityKind;
use metrics_exporter_prometheus::BuildError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors that stop a key from being fully processed by a pipeline.
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("failed to fetch {kind} {key}: {error}")]
    Fetch {
        kind: EntityKind,
        key: String,
        error: FetchError,
    },
    #[error("dedup store failed for {kind} {key}: {error}")]
    Store {
        kind: EntityKind,
        key: String,
        error: StoreError,
    },
    #[error("{kind} {key} is claimed by another consumer for up to {expires_in:?}")]
    InFlight {
        kind: EntityKind,
        key: String,
        expires_in: time::Duration,
    },
}

impl HandleError {
    /// Store outages and keys in flight are always worth another try, upstream errors only when
    /// the API says so.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandleError::Fetch { error, .. } => error.is_retryable(),
            HandleError::Store { .. } | HandleError::InFlight { .. } => true,
        }
    }

    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            HandleError::Fetch { error, .. } => error.retry_after(),
            // Waiting on a claim uses the regular backoff, the claim may complete much sooner
            HandleError::Store { .. } | HandleError::InFlight { .. } => None,
        }
    }

    /// Whether another try counts against the key's attempt budget. Waiting on somebody else's
    /// claim does not: the key keeps coming back until that claim completes or expires.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, HandleError::InFlight { .. })
    }
}

/// Enumeration of errors related to starting and seeding the crawl.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("dedup store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to create fetcher: {0}")]
    Fetcher(FetchError),
    #[error("failed to resolve seed account {name}: {error}")]
    Seed { name: String, error: FetchError },
    #[error("failed to publish seed player {key}: {error}")]
    SeedPublish { key: String, error: PublishError },
    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] BuildError),
}
