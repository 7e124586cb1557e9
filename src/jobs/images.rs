//! Artwork download and cache validation jobs

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::queue::{ConflictPolicy, Job, JobContext, Partitioning, QueueName};
use crate::services::providers::is_valid_image;

/// Partition shared by every image download
pub const IMAGES_PARTITION: &str = "Images";

/// Cache file for `url` under `dir`: the hex SHA-256 of the URL plus its extension
pub fn image_cache_path(dir: &Path, url: &str) -> PathBuf {
    let digest = Sha256::digest(url.as_bytes());
    let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let extension = Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
        })
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "img".to_string());
    dir.join(format!("{}.{}", name, extension))
}

/// Download one image into the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadImageJob {
    pub url: String,
}

impl DownloadImageJob {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Job for DownloadImageJob {
    const TYPE_TAG: &'static str = "DownloadImage";
    const QUEUE: QueueName = QueueName::Images;
    const PRIORITY: i32 = 10;
    const PARTITIONING: Partitioning = Partitioning::Shared {
        tag: IMAGES_PARTITION,
        max: 4,
    };
    const CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::Ignore;

    fn dedup_key(&self) -> String {
        format!("image:{}", self.url)
    }

    fn describe(&self) -> String {
        format!("Downloading image {}", self.url)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let services = ctx.services();
        let destination = image_cache_path(services.image_dir(), &self.url);
        if is_valid_image(&destination).await {
            debug!(url = %self.url, "Image already cached");
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Ok(());
        }

        let bytes = services
            .image_fetcher()?
            .fetch(&self.url, &destination)
            .await
            .with_context(|| format!("Failed to download {}", self.url))?;
        info!(url = %self.url, bytes, "Image cached");
        Ok(())
    }
}

/// Re-download every catalog image that is missing or corrupt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateAllImagesJob {}

#[async_trait]
impl Job for ValidateAllImagesJob {
    const TYPE_TAG: &'static str = "ValidateAllImages";
    const QUEUE: QueueName = QueueName::Images;
    const PRIORITY: i32 = 10;
    const PARTITIONING: Partitioning = Partitioning::Exclusive;
    const CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::Ignore;

    fn dedup_key(&self) -> String {
        "images:validate".to_string()
    }

    fn describe(&self) -> String {
        "Validating cached images".to_string()
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let services = ctx.services();
        let urls = services.catalog().image_urls().await?;
        let mut queued = 0usize;

        for (checked, url) in urls.iter().enumerate() {
            if ctx.is_cancelled() {
                warn!(checked, total = urls.len(), queued, "Image validation cancelled");
                break;
            }
            if is_valid_image(&image_cache_path(services.image_dir(), url)).await {
                continue;
            }
            ctx.scheduler().enqueue(&DownloadImageJob::new(url.as_str())).await?;
            queued += 1;
        }

        info!(total = urls.len(), queued, "Image validation finished");
        Ok(())
    }
}
