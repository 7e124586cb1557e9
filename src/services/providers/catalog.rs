//! Where job results end up

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::hasher::FileHashes;
use super::metadata::ProviderSeries;

/// Persists what jobs learn about the library
#[async_trait]
pub trait CatalogSink: Send + Sync {
    /// Record provider metadata, optionally linked to a local series id
    async fn store_series(&self, provider: &str, local_id: Option<u64>, series: &ProviderSeries) -> anyhow::Result<()>;

    async fn has_series(&self, provider: &str, series_id: u64) -> anyhow::Result<bool>;

    async fn store_file_hashes(&self, path: &Path, hashes: &FileHashes) -> anyhow::Result<()>;

    /// Every artwork URL referenced by stored metadata
    async fn image_urls(&self) -> anyhow::Result<Vec<String>>;
}

/// In-process catalog, used when no database is attached
#[derive(Default)]
pub struct MemoryCatalog {
    series: Mutex<BTreeMap<(String, u64), (Option<u64>, ProviderSeries)>>,
    hashes: Mutex<HashMap<PathBuf, FileHashes>>,
}

impl MemoryCatalog {
    pub fn series(&self, provider: &str, series_id: u64) -> Option<(Option<u64>, ProviderSeries)> {
        self.series.lock().get(&(provider.to_string(), series_id)).cloned()
    }

    pub fn file_hashes(&self, path: &Path) -> Option<FileHashes> {
        self.hashes.lock().get(path).cloned()
    }
}

#[async_trait]
impl CatalogSink for MemoryCatalog {
    async fn store_series(&self, provider: &str, local_id: Option<u64>, series: &ProviderSeries) -> anyhow::Result<()> {
        let mut stored = self.series.lock();
        let key = (provider.to_string(), series.id);
        // keep an existing link when a plain refresh arrives
        let local_id = local_id.or_else(|| stored.get(&key).and_then(|(id, _)| *id));
        stored.insert(key, (local_id, series.clone()));
        Ok(())
    }

    async fn has_series(&self, provider: &str, series_id: u64) -> anyhow::Result<bool> {
        Ok(self.series.lock().contains_key(&(provider.to_string(), series_id)))
    }

    async fn store_file_hashes(&self, path: &Path, hashes: &FileHashes) -> anyhow::Result<()> {
        self.hashes.lock().insert(path.to_path_buf(), hashes.clone());
        Ok(())
    }

    async fn image_urls(&self) -> anyhow::Result<Vec<String>> {
        let mut urls: Vec<String> = self
            .series
            .lock()
            .values()
            .filter_map(|(_, series)| series.poster_url.clone())
            .collect();
        urls.sort();
        urls.dedup();
        Ok(urls)
    }
}
