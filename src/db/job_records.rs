//! Job record persistence

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::warn;

use super::sqlite_helpers::{datetime_to_str, str_to_datetime};
use crate::error::{QueueError, QueueResult};
use crate::queue::{Exclusions, JobRecord, JobStore, NewJobRecord, QueueName};

const COLUMNS: &str = "id, queue, priority, type_tag, dedup_key, parameters, updated_at";
const DISPATCH_ORDER: &str = " ORDER BY priority ASC, updated_at ASC, id ASC";

#[derive(Debug, sqlx::FromRow)]
struct JobRecordRow {
    id: i64,
    queue: String,
    priority: i32,
    type_tag: String,
    dedup_key: String,
    parameters: String,
    updated_at: String,
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRecordRow) -> QueueResult<Self> {
        let corrupt = |reason: String| QueueError::CorruptRecord { id: row.id, reason };
        let queue = row.queue.parse::<QueueName>().map_err(|e| corrupt(e.to_string()))?;
        let updated_at = str_to_datetime(&row.updated_at).map_err(|e| corrupt(e.to_string()))?;
        Ok(JobRecord {
            id: row.id,
            queue,
            priority: row.priority,
            type_tag: row.type_tag,
            dedup_key: row.dedup_key,
            parameters: row.parameters,
            updated_at,
        })
    }
}

fn map_insert_error(err: sqlx::Error, record: &NewJobRecord) -> QueueError {
    match err.as_database_error() {
        Some(db_err) if db_err.is_unique_violation() => QueueError::DuplicateJob {
            queue: record.queue,
            dedup_key: record.dedup_key.clone(),
        },
        _ => QueueError::StoreUnavailable(err),
    }
}

async fn insert_with<'e, E>(executor: E, record: NewJobRecord) -> QueueResult<JobRecord>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let updated_at = Utc::now().trunc_subsecs(6);
    let result = sqlx::query(
        r#"
        INSERT INTO job_records (queue, priority, type_tag, dedup_key, parameters, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.queue.as_str())
    .bind(record.priority)
    .bind(&record.type_tag)
    .bind(&record.dedup_key)
    .bind(&record.parameters)
    .bind(datetime_to_str(updated_at))
    .execute(executor)
    .await
    .map_err(|e| map_insert_error(e, &record))?;

    Ok(JobRecord {
        id: result.last_insert_rowid(),
        queue: record.queue,
        priority: record.priority,
        type_tag: record.type_tag,
        dedup_key: record.dedup_key,
        parameters: record.parameters,
        updated_at,
    })
}

fn push_id_exclusions(builder: &mut QueryBuilder<'_, Sqlite>, ids: &HashSet<i64>) {
    if ids.is_empty() {
        return;
    }
    builder.push(" AND id NOT IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

/// SQLite-backed [`JobStore`]
#[derive(Clone)]
pub struct JobRecordRepository {
    pool: SqlitePool,
}

impl JobRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRecordRepository {
    async fn insert(&self, record: NewJobRecord) -> QueueResult<JobRecord> {
        insert_with(&self.pool, record).await
    }

    async fn replace(&self, existing_id: i64, record: NewJobRecord) -> QueueResult<JobRecord> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_records WHERE id = ?")
            .bind(existing_id)
            .execute(&mut *tx)
            .await?;
        let inserted = insert_with(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRecordRow>(&format!(
            "SELECT {COLUMNS} FROM job_records WHERE queue = ? AND dedup_key = ?"
        ))
        .bind(queue.as_str())
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn delete_by_dedup_key(&self, queue: QueueName, dedup_key: &str) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM job_records WHERE queue = ? AND dedup_key = ?")
            .bind(queue.as_str())
            .bind(dedup_key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_id(&self, id: i64) -> QueueResult<bool> {
        let result = sqlx::query("DELETE FROM job_records WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_eligible(&self, queue: QueueName, exclusions: &Exclusions) -> QueueResult<Option<JobRecord>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM job_records WHERE queue = "));
        builder.push_bind(queue.as_str());

        if !exclusions.type_tags.is_empty() {
            builder.push(" AND type_tag NOT IN (");
            let mut separated = builder.separated(", ");
            for tag in &exclusions.type_tags {
                separated.push_bind(tag.clone());
            }
            separated.push_unseparated(")");
        }
        push_id_exclusions(&mut builder, &exclusions.record_ids);
        builder.push(DISPATCH_ORDER);
        builder.push(" LIMIT 1");

        let row = builder
            .build_query_as::<JobRecordRow>()
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn count_pending(&self, queue: QueueName, excluded: &HashSet<i64>) -> QueueResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM job_records WHERE queue = ");
        builder.push_bind(queue.as_str());
        push_id_exclusions(&mut builder, excluded);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn list_pending(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecordRow>(&format!(
            "SELECT {COLUMNS} FROM job_records WHERE queue = ?{DISPATCH_ORDER} LIMIT ?"
        ))
        .bind(queue.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        // unreadable rows are left for the dispatch loop to drop
        Ok(rows
            .into_iter()
            .filter_map(|row| match JobRecord::try_from(row) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(queue = %queue, error = %err, "Skipping unreadable job record");
                    None
                }
            })
            .collect())
    }

    async fn delete_all(&self, queue: QueueName) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM job_records WHERE queue = ?")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
