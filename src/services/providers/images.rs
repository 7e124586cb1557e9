//! Artwork downloads

use std::fmt;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::services::rate_limiter::{
    RateLimitConfig, RateLimitedClient, RetryConfig, ResponseExt, retry_async,
};

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download `url` to `destination`, returning the number of bytes written
    async fn fetch(&self, url: &str, destination: &Path) -> anyhow::Result<u64>;
}

#[derive(Debug)]
enum DownloadError {
    Transient(String),
    Permanent(String),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Transient(message) | DownloadError::Permanent(message) => f.write_str(message),
        }
    }
}

pub struct HttpImageFetcher {
    client: RateLimitedClient,
    retry: RetryConfig,
}

impl HttpImageFetcher {
    pub fn new(rate: RateLimitConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: RateLimitedClient::new("images", rate)?,
            retry: RetryConfig::default(),
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self
            .client
            .get(url)
            .await
            .map_err(|e| DownloadError::Transient(format!("{e:#}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("GET {} returned HTTP {}", url, status.as_u16());
            return Err(if response.is_transient_error() {
                DownloadError::Transient(message)
            } else {
                DownloadError::Permanent(message)
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DownloadError::Transient(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> anyhow::Result<u64> {
        let bytes = retry_async(
            || self.download(url),
            |e| matches!(e, DownloadError::Transient(_)),
            &self.retry,
            "image download",
        )
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

        if !looks_like_image(&bytes) {
            anyhow::bail!("{} did not return an image", url);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let partial = destination.with_extension("part");
        tokio::fs::write(&partial, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("Failed to move image into {}", destination.display()))?;

        debug!(url, destination = %destination.display(), bytes = bytes.len(), "Image stored");
        Ok(bytes.len() as u64)
    }
}

fn looks_like_image(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"\x89PNG\r\n\x1a\n")
        || bytes.starts_with(b"GIF8")
        || (bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP")
}

/// Whether `path` exists and starts with a known image signature
pub async fn is_valid_image(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let mut header = [0u8; 12];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    looks_like_image(&header[..filled])
}
