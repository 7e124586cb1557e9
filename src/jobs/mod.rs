//! Job kinds the server registers at startup
//!
//! Each job is a small serde struct whose fields are its persisted parameters.
//! Execution delegates to the collaborators in [`crate::services::providers`].

pub mod hash_file;
pub mod images;
pub mod providers;

use std::time::Duration;

use tracing::{debug, warn};

pub use hash_file::HashFileJob;
pub use images::{DownloadImageJob, ValidateAllImagesJob, image_cache_path};
pub use providers::{
    AniDbGetAnimeJob, SyncWatchedStateJob, TmdbSearchSeriesJob, TvDbSearchSeriesJob, ANIDB_PARTITION,
    TMDB_PARTITION, TRAKT_PARTITION, TVDB_PARTITION,
};

use crate::queue::{Job, JobContext, JobRegistry};
use crate::services::providers::ProviderError;

/// Ban applied when a provider rate limits without saying for how long
pub const DEFAULT_PROVIDER_BAN: Duration = Duration::from_secs(10 * 60);

/// Registry with every job kind this crate ships
pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .register::<HashFileJob>()
        .register::<DownloadImageJob>()
        .register::<ValidateAllImagesJob>()
        .register::<TvDbSearchSeriesJob>()
        .register::<TmdbSearchSeriesJob>()
        .register::<AniDbGetAnimeJob>()
        .register::<SyncWatchedStateJob>()
}

/// Turn a provider failure into the job's outcome.
///
/// A rate limit bans the job's partition and puts the job back behind the ban.
/// Everything else fails the job.
pub(crate) async fn handle_provider_error<J: Job>(
    ctx: &JobContext,
    job: &J,
    error: ProviderError,
) -> anyhow::Result<()> {
    let partition = J::PARTITIONING.tag(J::TYPE_TAG);
    let (true, Some(partition)) = (error.is_rate_limited(), partition) else {
        return Err(error.into());
    };

    let ban = error.retry_after().unwrap_or(DEFAULT_PROVIDER_BAN);
    let until = ctx.scheduler().ban_partition(partition, ban, error.to_string());
    warn!(
        type_tag = J::TYPE_TAG,
        dedup_key = %job.dedup_key(),
        partition,
        until = %until,
        "Provider rate limited, partition banned"
    );

    // the job's own record holds its dedup key until completion
    ctx.requeue_after_completion(job)?;
    debug!("Requeue scheduled behind partition ban");
    Ok(())
}
