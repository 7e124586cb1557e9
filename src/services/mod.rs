//! Services the job queues run on top of

pub mod database;
pub mod manager;
pub mod providers;
pub mod queue;
pub mod rate_limiter;

pub use database::DatabaseService;
pub use manager::{HealthStatus, Service, ServiceHealth, ServicesManager, ServicesManagerBuilder};
pub use providers::{
    CatalogSink, FileHasher, FileHashes, HttpImageFetcher, HttpMetadataProvider, ImageFetcher, JobServices,
    MemoryCatalog, MetadataProvider, ProviderError, ProviderSeries, StreamingFileHasher,
};
pub use queue::QueueService;
pub use rate_limiter::{RateLimitConfig, RateLimitedClient, RetryConfig, retry_async};
