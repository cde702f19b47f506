//! Resolution of players and matches against the upstream game-data API.
use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::keys::{MatchKey, PlayerKey};

const API_KEY_HEADER: &str = "X-Riot-Token";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to construct http client: {0}")]
    Client(reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("{0} cannot be used as a base url")]
    BaseUrl(String),
    #[error("request to {url} failed: {error}")]
    Request { url: String, error: reqwest::Error },
    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: StatusCode,
        retry_after: Option<time::Duration>,
    },
    #[error("unexpected response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

impl FetchError {
    /// Transport failures, rate limiting and server errors may succeed later. Anything else will
    /// fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request { .. } => true,
            FetchError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// A fetched match: the raw payload we archive, and the players that took part in it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub payload: Value,
    pub participants: Vec<PlayerKey>,
}

impl MatchRecord {
    /// Participants are listed under `metadata.participants`. Nothing else in the payload is
    /// looked at.
    pub fn from_payload(payload: Value) -> Option<Self> {
        let participants = payload
            .get("metadata")?
            .get("participants")?
            .as_array()?
            .iter()
            .map(|participant| participant.as_str().map(PlayerKey::from))
            .collect::<Option<Vec<_>>>()?;

        Some(Self {
            payload,
            participants,
        })
    }
}

#[async_trait]
pub trait EntityFetcher: Send + Sync {
    async fn resolve_matches_for_player(
        &self,
        player: &PlayerKey,
    ) -> Result<Vec<MatchKey>, FetchError>;

    async fn resolve_match_details(&self, match_key: &MatchKey)
        -> Result<MatchRecord, FetchError>;

    /// Resolve a human-readable account name into the player key used everywhere else.
    async fn resolve_account(&self, name: &str) -> Result<PlayerKey, FetchError>;
}

#[derive(Deserialize)]
struct Summoner {
    puuid: String,
}

/// Client for the Riot Games API. Account lookups go to the platform host (e.g. euw1), match
/// lookups to the regional routing host (e.g. europe).
pub struct RiotFetcher {
    client: reqwest::Client,
    api_key: String,
    platform_url: Url,
    regional_url: Url,
    match_history_count: Option<u32>,
}

impl RiotFetcher {
    pub fn new(
        api_key: &str,
        platform_url: &str,
        regional_url: &str,
        request_timeout: time::Duration,
        match_history_count: Option<u32>,
    ) -> Result<Self, FetchError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("match-crawler")
            .timeout(request_timeout)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            api_key: api_key.to_owned(),
            platform_url: Url::parse(platform_url)?,
            regional_url: Url::parse(regional_url)?,
            match_history_count,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, url: Url) -> Result<T, FetchError> {
        debug!(%url, "fetching");
        let started = tokio::time::Instant::now();

        let response = self
            .client
            .get(url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|error| FetchError::Request {
                url: url.to_string(),
                error,
            })?;

        let status = response.status();
        metrics::histogram!(
            "crawl_fetch_duration_seconds",
            &[("endpoint", endpoint.to_owned()), ("status", status.as_u16().to_string())]
        )
        .record(started.elapsed().as_secs_f64());

        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
                retry_after: parse_retry_after_header(response.headers()),
            });
        }

        let body = response.bytes().await.map_err(|error| FetchError::Request {
            url: url.to_string(),
            error,
        })?;

        serde_json::from_slice(&body).map_err(|error| FetchError::Parse {
            url: url.to_string(),
            reason: error.to_string(),
        })
    }
}

/// Append path segments to a base url, percent-encoding each of them.
fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FetchError::BaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl EntityFetcher for RiotFetcher {
    async fn resolve_matches_for_player(
        &self,
        player: &PlayerKey,
    ) -> Result<Vec<MatchKey>, FetchError> {
        let mut url = endpoint_url(
            &self.regional_url,
            &["lol", "match", "v5", "matches", "by-puuid", player.as_str(), "ids"],
        )?;
        if let Some(count) = self.match_history_count {
            url.query_pairs_mut()
                .append_pair("count", &count.to_string());
        }

        self.get_json("matches_by_puuid", url).await
    }

    async fn resolve_match_details(
        &self,
        match_key: &MatchKey,
    ) -> Result<MatchRecord, FetchError> {
        let url = endpoint_url(
            &self.regional_url,
            &["lol", "match", "v5", "matches", match_key.as_str()],
        )?;

        let payload: Value = self.get_json("match", url.clone()).await?;
        MatchRecord::from_payload(payload).ok_or_else(|| FetchError::Parse {
            url: url.to_string(),
            reason: "match has no metadata.participants list".to_owned(),
        })
    }

    async fn resolve_account(&self, name: &str) -> Result<PlayerKey, FetchError> {
        let url = endpoint_url(
            &self.platform_url,
            &["lol", "summoner", "v4", "summoners", "by-name", name],
        )?;

        let summoner: Summoner = self.get_json("summoner_by_name", url).await?;
        Ok(PlayerKey(summoner.puuid))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
