//! Application configuration management

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::queue::{QueueName, QueueSettings};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file path, or a `sqlite:` URL
    pub database_url: String,

    /// How long to keep retrying the initial database connection
    pub database_connect_timeout: Duration,

    pub general_workers: usize,
    pub hasher_workers: usize,
    pub images_workers: usize,

    /// Idle re-check interval for every dispatch loop
    pub poll_interval: Duration,

    /// Cap for the store-outage retry delay
    pub store_backoff_max: Duration,

    /// Start every queue paused
    pub start_paused: bool,

    /// Per-partition overrides of the declared concurrency bound
    pub partition_limits: HashMap<String, usize>,

    /// Directory downloaded artwork is written to
    pub image_cache_path: String,

    /// `(provider, base URL)` pairs for HTTP metadata providers
    pub metadata_providers: Vec<(String, String)>,

    /// Request budget per provider
    pub provider_requests_per_second: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // For SQLite, prefer DATABASE_PATH, fall back to DATABASE_URL
        let database_url = lookup("DATABASE_PATH")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "./data/media-queue.db".to_string());

        Ok(Self {
            database_url,

            database_connect_timeout: Duration::from_secs(
                var("DATABASE_CONNECT_TIMEOUT_SECS", "30")
                    .parse()
                    .context("Invalid DATABASE_CONNECT_TIMEOUT_SECS")?,
            ),

            general_workers: var("QUEUE_GENERAL_WORKERS", "4")
                .parse()
                .context("Invalid QUEUE_GENERAL_WORKERS")?,

            hasher_workers: var("QUEUE_HASHER_WORKERS", "1")
                .parse()
                .context("Invalid QUEUE_HASHER_WORKERS")?,

            images_workers: var("QUEUE_IMAGES_WORKERS", "2")
                .parse()
                .context("Invalid QUEUE_IMAGES_WORKERS")?,

            poll_interval: Duration::from_millis(
                var("QUEUE_POLL_INTERVAL_MS", "5000")
                    .parse()
                    .context("Invalid QUEUE_POLL_INTERVAL_MS")?,
            ),

            store_backoff_max: Duration::from_secs(
                var("QUEUE_STORE_BACKOFF_MAX_SECS", "60")
                    .parse()
                    .context("Invalid QUEUE_STORE_BACKOFF_MAX_SECS")?,
            ),

            start_paused: lookup("QUEUE_START_PAUSED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            partition_limits: parse_partition_limits(&var("QUEUE_PARTITION_LIMITS", ""))
                .context("Invalid QUEUE_PARTITION_LIMITS")?,

            image_cache_path: var("IMAGE_CACHE_PATH", "./data/images"),

            metadata_providers: parse_providers(&var("METADATA_PROVIDERS", ""))
                .context("Invalid METADATA_PROVIDERS")?,

            provider_requests_per_second: var("PROVIDER_REQUESTS_PER_SECOND", "2")
                .parse()
                .unwrap_or(2),
        })
    }

    /// Settings for one queue
    pub fn queue_settings(&self, queue: QueueName) -> QueueSettings {
        let worker_slots = match queue {
            QueueName::General => self.general_workers,
            QueueName::Hasher => self.hasher_workers,
            QueueName::Images => self.images_workers,
        };
        QueueSettings {
            worker_slots: worker_slots.max(1),
            poll_interval: self.poll_interval,
            store_backoff_max: self.store_backoff_max,
        }
    }
}

/// Parse `"TvDB=2,AniDB=1"`
fn parse_partition_limits(value: &str) -> Result<HashMap<String, usize>> {
    let mut limits = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((tag, max)) = entry.split_once('=') else {
            bail!("expected PARTITION=MAX, got '{}'", entry);
        };
        let max = max
            .trim()
            .parse()
            .with_context(|| format!("invalid limit for partition '{}'", tag.trim()))?;
        limits.insert(tag.trim().to_string(), max);
    }
    Ok(limits)
}

/// Parse `"tvdb=https://api.example/v4,anidb=https://..."`
fn parse_providers(value: &str) -> Result<Vec<(String, String)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok((name.trim().to_ascii_lowercase(), url.trim().to_string()))
            }
            _ => bail!("expected NAME=URL, got '{}'", entry),
        })
        .collect()
}
