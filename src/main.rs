//! media-queue - background job scheduler for the media library server
//!
//! Runs the general, hasher and images queues against the SQLite job store
//! until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_queue::cli::CliOptions;
use media_queue::config::Config;
use media_queue::db::Database;
use media_queue::jobs::{self, AniDbGetAnimeJob, HashFileJob, ValidateAllImagesJob};
use media_queue::queue::{QueueName, Scheduler, USER_PRIORITY};
use media_queue::services::rate_limiter::RateLimitConfig;
use media_queue::services::{
    DatabaseService, HttpImageFetcher, HttpMetadataProvider, JobServices, QueueService, ServicesManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = CliOptions::from_args();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "media_queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting media-queue");

    let db = Database::connect_with_retry(
        &config.database_url,
        Duration::from_secs(2),
        config.database_connect_timeout,
    )
    .await?;
    tracing::info!(database = %config.database_url, "Database connected");

    let rate = RateLimitConfig {
        requests_per_second: config.provider_requests_per_second,
        ..RateLimitConfig::default()
    };
    let mut services = JobServices::new()
        .with_catalog(Arc::new(db.catalog()))
        .with_image_dir(&config.image_cache_path)
        .with_image_fetcher(Arc::new(HttpImageFetcher::new(rate.clone())?));
    for (name, base_url) in &config.metadata_providers {
        let provider = HttpMetadataProvider::new(name, base_url, rate.clone())
            .with_context(|| format!("Invalid metadata provider '{}'", name))?;
        services = services.with_provider(name, Arc::new(provider));
        tracing::info!(provider = %name, base_url = %base_url, "Metadata provider configured");
    }

    let mut builder = Scheduler::builder(Arc::new(db.job_records()), jobs::registry())
        .services(services)
        .partition_limits(config.partition_limits.clone())
        .start_paused(config.start_paused || cli.start_paused);
    for queue in QueueName::ALL {
        builder = builder.queue(queue, config.queue_settings(queue));
    }
    let scheduler = builder.build();

    let manager = ServicesManager::builder()
        .add_service(Arc::new(DatabaseService::new(db.clone())))
        .add_service(Arc::new(QueueService::new(scheduler.clone())))
        .start()
        .await?;

    for queue in &cli.clear {
        let removed = scheduler.queue(*queue)?.clear().await?;
        tracing::info!(queue = %queue, removed, "Queue cleared");
    }
    for path in &cli.hash {
        scheduler.enqueue_with_priority(&HashFileJob::new(path), USER_PRIORITY).await?;
    }
    for anime_id in &cli.anidb {
        let job = AniDbGetAnimeJob {
            force_refresh: true,
            ..AniDbGetAnimeJob::new(*anime_id)
        };
        scheduler.enqueue_with_priority(&job, USER_PRIORITY).await?;
    }
    if cli.validate_images {
        scheduler.enqueue(&ValidateAllImagesJob::default()).await?;
    }

    for queue in scheduler.queues() {
        let mut events = queue.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => tracing::info!(
                        queue = %event.queue,
                        state = %event.state,
                        pending = event.pending_count,
                        running = event.running_count,
                        current = event.current_job_description.as_deref().unwrap_or(""),
                        "Queue state changed"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Queue state listener lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining queues");
    manager.stop_all().await?;
    tracing::info!("Stopped");
    Ok(())
}
