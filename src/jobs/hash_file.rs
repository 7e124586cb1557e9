//! File hashing job

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::queue::{ConflictPolicy, Job, JobContext, QueueName};

/// Hash one library file and store the result in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashFileJob {
    pub path: PathBuf,
}

impl HashFileJob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Job for HashFileJob {
    const TYPE_TAG: &'static str = "HashFile";
    const QUEUE: QueueName = QueueName::Hasher;
    const PRIORITY: i32 = 4;
    const CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::Ignore;

    fn dedup_key(&self) -> String {
        format!("hash:{}", self.path.display())
    }

    fn describe(&self) -> String {
        format!("Hashing {}", self.path.display())
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let services = ctx.services();
        let hashes = services
            .hasher()
            .hash_file(&self.path, ctx.cancellation())
            .await
            .with_context(|| format!("Failed to hash {}", self.path.display()))?;

        services.catalog().store_file_hashes(&self.path, &hashes).await?;

        info!(
            path = %self.path.display(),
            size = hashes.size,
            crc32 = %hashes.crc32,
            "File hashed"
        );
        Ok(())
    }
}
