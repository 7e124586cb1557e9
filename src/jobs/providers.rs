//! Metadata provider jobs
//!
//! Every provider gets its own partition so a slow or rate limiting provider
//! only holds back its own jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::handle_provider_error;
use super::images::DownloadImageJob;
use crate::queue::{ConflictPolicy, Job, JobContext, Partitioning};
use crate::services::providers::{ANIDB, ProviderError, TMDB, TRAKT, TVDB};

pub const TVDB_PARTITION: &str = "TvDB";
pub const TMDB_PARTITION: &str = "TMDB";
pub const ANIDB_PARTITION: &str = "AniDB";
pub const TRAKT_PARTITION: &str = "Trakt";

/// Search `provider` for `title` and link the best match to `anime_id`
async fn search_and_link<J: Job>(
    ctx: &JobContext,
    job: &J,
    provider: &str,
    anime_id: u64,
    title: &str,
) -> anyhow::Result<()> {
    let services = ctx.services();
    let results = match services.provider(provider)?.search_series(title).await {
        Ok(results) => results,
        Err(e) => return handle_provider_error(ctx, job, e).await,
    };

    let Some(best) = results.first() else {
        info!(provider, anime_id, title, "No search results");
        return Ok(());
    };
    services.catalog().store_series(provider, Some(anime_id), best).await?;
    info!(provider, anime_id, series_id = best.id, matches = results.len(), "Series linked");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TvDbSearchSeriesJob {
    pub anime_id: u64,
    pub title: String,
}

#[async_trait]
impl Job for TvDbSearchSeriesJob {
    const TYPE_TAG: &'static str = "TvDbSearchSeries";
    const PARTITIONING: Partitioning = Partitioning::Shared {
        tag: TVDB_PARTITION,
        max: 4,
    };

    fn dedup_key(&self) -> String {
        format!("tvdb:search:{}", self.anime_id)
    }

    fn describe(&self) -> String {
        format!("Searching TvDB for '{}'", self.title)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        search_and_link(ctx, self, TVDB, self.anime_id, &self.title).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmdbSearchSeriesJob {
    pub anime_id: u64,
    pub title: String,
}

#[async_trait]
impl Job for TmdbSearchSeriesJob {
    const TYPE_TAG: &'static str = "TmdbSearchSeries";
    const PARTITIONING: Partitioning = Partitioning::Shared {
        tag: TMDB_PARTITION,
        max: 4,
    };

    fn dedup_key(&self) -> String {
        format!("tmdb:search:{}", self.anime_id)
    }

    fn describe(&self) -> String {
        format!("Searching TMDB for '{}'", self.title)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        search_and_link(ctx, self, TMDB, self.anime_id, &self.title).await
    }
}

fn default_true() -> bool {
    true
}

/// Fetch one anime from AniDB, optionally queueing its poster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AniDbGetAnimeJob {
    pub anime_id: u64,
    /// Refetch even when the anime is already in the catalog
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default = "default_true")]
    pub download_images: bool,
}

impl AniDbGetAnimeJob {
    pub fn new(anime_id: u64) -> Self {
        Self {
            anime_id,
            force_refresh: false,
            download_images: true,
        }
    }
}

#[async_trait]
impl Job for AniDbGetAnimeJob {
    const TYPE_TAG: &'static str = "AniDbGetAnime";
    const PRIORITY: i32 = 2;
    // AniDB bans clients that send concurrent requests
    const PARTITIONING: Partitioning = Partitioning::Shared {
        tag: ANIDB_PARTITION,
        max: 1,
    };

    fn dedup_key(&self) -> String {
        format!("anidb:anime:{}", self.anime_id)
    }

    fn describe(&self) -> String {
        format!("Getting AniDB anime {}", self.anime_id)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        let services = ctx.services();
        if !self.force_refresh && services.catalog().has_series(ANIDB, self.anime_id).await? {
            info!(anime_id = self.anime_id, "Anime already cached, skipping");
            return Ok(());
        }

        let series = match services.provider(ANIDB)?.fetch_series(self.anime_id).await {
            Ok(series) => series,
            Err(ProviderError::NotFound { .. }) => {
                info!(anime_id = self.anime_id, "Anime not found on AniDB");
                return Ok(());
            }
            Err(e) => return handle_provider_error(ctx, self, e).await,
        };
        services.catalog().store_series(ANIDB, None, &series).await?;
        info!(anime_id = self.anime_id, title = %series.title, "Anime updated");

        if self.download_images {
            if let Some(url) = &series.poster_url {
                ctx.scheduler().enqueue(&DownloadImageJob::new(url.as_str())).await?;
            }
        }
        Ok(())
    }
}

/// Push a watched flag for one episode to Trakt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWatchedStateJob {
    pub series_id: u64,
    pub episode: u32,
    pub watched: bool,
}

#[async_trait]
impl Job for SyncWatchedStateJob {
    const TYPE_TAG: &'static str = "SyncWatchedState";
    const PRIORITY: i32 = 7;
    const PARTITIONING: Partitioning = Partitioning::Shared {
        tag: TRAKT_PARTITION,
        max: 1,
    };
    const CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::Error;

    fn dedup_key(&self) -> String {
        format!("trakt:watched:{}:{}", self.series_id, self.episode)
    }

    fn describe(&self) -> String {
        let state = if self.watched { "watched" } else { "unwatched" };
        format!("Marking series {} episode {} {}", self.series_id, self.episode, state)
    }

    async fn execute(&self, ctx: &JobContext) -> anyhow::Result<()> {
        match ctx
            .services()
            .provider(TRAKT)?
            .push_watched(self.series_id, self.episode, self.watched)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => handle_provider_error(ctx, self, e).await,
        }
    }
}
