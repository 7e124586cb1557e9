//! Metadata provider client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::services::rate_limiter::{RateLimitConfig, RateLimitedClient, ResponseExt};

/// Series metadata as returned by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSeries {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider asked us to slow down
    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider} has no entry {id}")]
    NotFound { provider: String, id: String },

    #[error("{provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },

    #[error("request to {provider} failed: {source}")]
    Request {
        provider: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{provider} response could not be decoded: {message}")]
    Decode { provider: String, message: String },

    #[error("metadata provider '{0}' is not configured")]
    NotConfigured(String),
}

impl ProviderError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_series(&self, series_id: u64) -> Result<ProviderSeries, ProviderError>;

    async fn search_series(&self, title: &str) -> Result<Vec<ProviderSeries>, ProviderError>;

    /// Push a watched/unwatched flag for one episode
    async fn push_watched(&self, series_id: u64, episode: u32, watched: bool) -> Result<(), ProviderError>;
}

#[derive(Serialize)]
struct WatchedBody {
    episode: u32,
    watched: bool,
}

/// JSON-over-HTTP provider
///
/// Expects `GET series/{id}`, `GET search?q=` and `POST series/{id}/watched`
/// relative to the configured base URL.
pub struct HttpMetadataProvider {
    name: String,
    base_url: Url,
    client: RateLimitedClient,
}

impl HttpMetadataProvider {
    pub fn new(name: &str, base_url: &str, rate: RateLimitConfig) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            name: name.to_string(),
            base_url,
            client: RateLimitedClient::new(name, rate)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url.join(path).map_err(|e| ProviderError::Request {
            provider: self.name.clone(),
            source: e.into(),
        })
    }

    fn request_error(&self, source: anyhow::Error) -> ProviderError {
        ProviderError::Request {
            provider: self.name.clone(),
            source,
        }
    }

    fn check(&self, response: Response, id: &str) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
                provider: self.name.clone(),
                retry_after: response.retry_after(),
            },
            StatusCode::NOT_FOUND => ProviderError::NotFound {
                provider: self.name.clone(),
                id: id.to_string(),
            },
            _ => ProviderError::Status {
                provider: self.name.clone(),
                status: status.as_u16(),
            },
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, response: Response) -> Result<T, ProviderError> {
        response.json::<T>().await.map_err(|e| ProviderError::Decode {
            provider: self.name.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_series(&self, series_id: u64) -> Result<ProviderSeries, ProviderError> {
        let url = self.endpoint(&format!("series/{}", series_id))?;
        debug!(provider = %self.name, series_id, "Fetching series");
        let response = self
            .client
            .get(url.as_str())
            .await
            .map_err(|e| self.request_error(e))?;
        let response = self.check(response, &series_id.to_string())?;
        self.decode(response).await
    }

    async fn search_series(&self, title: &str) -> Result<Vec<ProviderSeries>, ProviderError> {
        let url = self.endpoint("search")?;
        debug!(provider = %self.name, title, "Searching series");
        let response = self
            .client
            .get_with_query(url.as_str(), &[("q", title)])
            .await
            .map_err(|e| self.request_error(e))?;
        let response = self.check(response, title)?;
        self.decode(response).await
    }

    async fn push_watched(&self, series_id: u64, episode: u32, watched: bool) -> Result<(), ProviderError> {
        let url = self.endpoint(&format!("series/{}/watched", series_id))?;
        let response = self
            .client
            .post_json(url.as_str(), &WatchedBody { episode, watched })
            .await
            .map_err(|e| self.request_error(e))?;
        self.check(response, &series_id.to_string())?;
        Ok(())
    }
}
