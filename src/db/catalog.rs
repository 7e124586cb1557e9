//! Provider metadata and file hash persistence

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::sqlite_helpers::now_iso8601;
use crate::services::providers::{CatalogSink, FileHashes, ProviderSeries};

/// A stored provider series with its optional local link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSeries {
    pub provider: String,
    pub local_id: Option<i64>,
    pub series: ProviderSeries,
}

#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_series(&self, provider: &str, series_id: u64) -> Result<Option<CatalogSeries>> {
        let row: Option<(Option<i64>, String)> = sqlx::query_as(
            "SELECT local_id, payload FROM provider_series WHERE provider = ? AND series_id = ?",
        )
        .bind(provider)
        .bind(i64::try_from(series_id)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(local_id, payload)| -> Result<CatalogSeries> {
            Ok(CatalogSeries {
                provider: provider.to_string(),
                local_id,
                series: serde_json::from_str(&payload).context("Corrupt provider_series payload")?,
            })
        })
        .transpose()
    }

    pub async fn get_file_hashes(&self, path: &Path) -> Result<Option<FileHashes>> {
        let row: Option<(i64, String, String)> =
            sqlx::query_as("SELECT size, crc32, sha256 FROM file_hashes WHERE path = ?")
                .bind(path.to_string_lossy().into_owned())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(size, crc32, sha256)| FileHashes {
            size: size.max(0) as u64,
            crc32,
            sha256,
        }))
    }
}

#[async_trait]
impl CatalogSink for CatalogRepository {
    async fn store_series(&self, provider: &str, local_id: Option<u64>, series: &ProviderSeries) -> Result<()> {
        let local_id = local_id.map(i64::try_from).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO provider_series (provider, series_id, local_id, title, poster_url, payload, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (provider, series_id) DO UPDATE SET
                local_id = COALESCE(excluded.local_id, provider_series.local_id),
                title = excluded.title,
                poster_url = excluded.poster_url,
                payload = excluded.payload,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(provider)
        .bind(i64::try_from(series.id)?)
        .bind(local_id)
        .bind(&series.title)
        .bind(&series.poster_url)
        .bind(serde_json::to_string(series)?)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await
        .context("Failed to store provider series")?;
        Ok(())
    }

    async fn has_series(&self, provider: &str, series_id: u64) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM provider_series WHERE provider = ? AND series_id = ?")
                .bind(provider)
                .bind(i64::try_from(series_id)?)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn store_file_hashes(&self, path: &Path, hashes: &FileHashes) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO file_hashes (path, size, crc32, sha256, hashed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(path.to_string_lossy().into_owned())
        .bind(i64::try_from(hashes.size)?)
        .bind(&hashes.crc32)
        .bind(&hashes.sha256)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await
        .context("Failed to store file hashes")?;
        Ok(())
    }

    async fn image_urls(&self) -> Result<Vec<String>> {
        let urls: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT poster_url FROM provider_series WHERE poster_url IS NOT NULL ORDER BY poster_url",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(urls)
    }
}
