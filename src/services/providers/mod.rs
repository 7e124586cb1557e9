//! Collaborators jobs call out to
//!
//! Jobs never construct clients themselves. They reach metadata providers, the
//! file hasher, the image fetcher and the catalog through [`JobServices`], which
//! the scheduler hands to every running job.

mod catalog;
mod hasher;
mod images;
mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use catalog::{CatalogSink, MemoryCatalog};
pub use hasher::{FileHashes, FileHasher, StreamingFileHasher};
pub use images::{HttpImageFetcher, ImageFetcher, is_valid_image};
pub use metadata::{HttpMetadataProvider, MetadataProvider, ProviderError, ProviderSeries};

pub const TVDB: &str = "tvdb";
pub const TMDB: &str = "tmdb";
pub const ANIDB: &str = "anidb";
pub const TRAKT: &str = "trakt";

/// Everything a running job may need from the outside world
pub struct JobServices {
    providers: HashMap<String, Arc<dyn MetadataProvider>>,
    hasher: Arc<dyn FileHasher>,
    images: Option<Arc<dyn ImageFetcher>>,
    catalog: Arc<dyn CatalogSink>,
    image_dir: PathBuf,
}

impl Default for JobServices {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            hasher: Arc::new(StreamingFileHasher::default()),
            images: None,
            catalog: Arc::new(MemoryCatalog::default()),
            image_dir: PathBuf::from("./data/images"),
        }
    }
}

impl JobServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under `name` (case-insensitive)
    pub fn with_provider(mut self, name: &str, provider: Arc<dyn MetadataProvider>) -> Self {
        self.providers.insert(name.to_ascii_lowercase(), provider);
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn FileHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_image_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.images = Some(fetcher);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogSink>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn provider(&self, name: &str) -> Result<&Arc<dyn MetadataProvider>, ProviderError> {
        self.providers
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| ProviderError::NotConfigured(name.to_string()))
    }

    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn hasher(&self) -> &Arc<dyn FileHasher> {
        &self.hasher
    }

    pub fn image_fetcher(&self) -> anyhow::Result<&Arc<dyn ImageFetcher>> {
        self.images
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no image fetcher configured"))
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogSink> {
        &self.catalog
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }
}
