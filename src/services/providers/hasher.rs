//! File content hashing

use std::path::Path;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashes {
    pub size: u64,
    /// Lowercase hex, 8 digits
    pub crc32: String,
    /// Lowercase hex
    pub sha256: String,
}

#[async_trait]
pub trait FileHasher: Send + Sync {
    /// Hash `path`, giving up early once `cancel` fires
    async fn hash_file(&self, path: &Path, cancel: &CancellationToken) -> anyhow::Result<FileHashes>;
}

/// Reads the file once and feeds every hasher from the same buffer
pub struct StreamingFileHasher {
    buffer_size: usize,
}

impl Default for StreamingFileHasher {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
        }
    }
}

impl StreamingFileHasher {
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(4096),
        }
    }
}

#[async_trait]
impl FileHasher for StreamingFileHasher {
    async fn hash_file(&self, path: &Path, cancel: &CancellationToken) -> anyhow::Result<FileHashes> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let mut buffer = vec![0u8; self.buffer_size];
        let mut crc = crc32fast::Hasher::new();
        let mut sha = Sha256::new();
        let mut size = 0u64;

        loop {
            if cancel.is_cancelled() {
                bail!("hashing {} was cancelled", path.display());
            }
            let read = file
                .read(&mut buffer)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if read == 0 {
                break;
            }
            crc.update(&buffer[..read]);
            sha.update(&buffer[..read]);
            size += read as u64;
        }

        Ok(FileHashes {
            size,
            crc32: format!("{:08x}", crc.finalize()),
            sha256: sha.finalize().iter().map(|b| format!("{:02x}", b)).collect(),
        })
    }
}
