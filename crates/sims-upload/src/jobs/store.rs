//! Job store trait and its PostgreSQL implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

use super::types::{
    from_db_count, page_size, to_db_count, JobDetail, JobStatus, NewJob, ResultCounts,
    ResultUpdate, UploadJob, UploadJobEvent, UploadJobResult, QUEUED_MESSAGE,
};
use crate::error::{IngestError, IngestResult};

/// Durable record of jobs, their event log and their results
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `Queued` and write its first event
    async fn create(&self, job: &NewJob) -> IngestResult<UploadJob>;

    /// Move a job to `status`, appending an event in the same transaction
    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: Option<&str>,
    ) -> IngestResult<UploadJob>;

    /// Create or update the single result row of a job
    async fn record_results(
        &self,
        job_id: Uuid,
        update: &ResultUpdate,
    ) -> IngestResult<UploadJobResult>;

    async fn save_rejected_rows_path(&self, job_id: Uuid, path: &str) -> IngestResult<()>;

    /// Events in ascending order; with a limit, only the latest `limit` events
    async fn list_events(
        &self,
        job_id: Uuid,
        limit: Option<usize>,
    ) -> IngestResult<Vec<UploadJobEvent>>;

    async fn get_job(&self, job_id: Uuid) -> IngestResult<UploadJob>;

    async fn get_result(&self, job_id: Uuid) -> IngestResult<Option<UploadJobResult>>;

    /// Newest first, page size clamped to `1..=100` (default 20)
    async fn list_recent_jobs(&self, limit: Option<usize>) -> IngestResult<Vec<UploadJob>>;

    async fn job_detail(&self, job_id: Uuid) -> IngestResult<JobDetail> {
        let job = self.get_job(job_id).await?;
        let result = self.get_result(job_id).await?;
        Ok(JobDetail { job, result })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    original_filename: String,
    workbook_type: String,
    workbook_name: Option<String>,
    worksheet_name: Option<String>,
    file_size: Option<i64>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for UploadJob {
    type Error = IngestError;

    fn try_from(row: JobRow) -> IngestResult<Self> {
        Ok(UploadJob {
            job_id: row.job_id,
            original_filename: row.original_filename,
            workbook_type: row.workbook_type,
            workbook_name: row.workbook_name,
            worksheet_name: row.worksheet_name,
            file_size: row.file_size,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    job_id: Uuid,
    status: String,
    message: Option<String>,
    event_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for UploadJobEvent {
    type Error = IngestError;

    fn try_from(row: EventRow) -> IngestResult<Self> {
        Ok(UploadJobEvent {
            event_id: row.event_id,
            job_id: row.job_id,
            status: row.status.parse()?,
            message: row.message,
            event_at: row.event_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    job_id: Uuid,
    total_rows: i64,
    processed_rows: i64,
    successful_rows: i64,
    rejected_rows: i64,
    normalized_table_name: Option<String>,
    rejected_rows_path: Option<String>,
    coverage_metadata: serde_json::Value,
    validation_summary: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for UploadJobResult {
    type Error = IngestError;

    fn try_from(row: ResultRow) -> IngestResult<Self> {
        Ok(UploadJobResult {
            job_id: row.job_id,
            counts: ResultCounts {
                total_rows: from_db_count(row.total_rows, "total_rows")?,
                processed_rows: from_db_count(row.processed_rows, "processed_rows")?,
                successful_rows: from_db_count(row.successful_rows, "successful_rows")?,
                rejected_rows: from_db_count(row.rejected_rows, "rejected_rows")?,
            },
            normalized_table_name: row.normalized_table_name,
            rejected_rows_path: row.rejected_rows_path,
            coverage_metadata: row.coverage_metadata,
            validation_summary: row
                .validation_summary
                .map(serde_json::from_value)
                .transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "job_id, original_filename, workbook_type, workbook_name, \
     worksheet_name, file_size, status, created_at, updated_at";

const RESULT_COLUMNS: &str = "job_id, total_rows, processed_rows, successful_rows, \
     rejected_rows, normalized_table_name, rejected_rows_path, coverage_metadata, \
     validation_summary, created_at, updated_at";

/// PostgreSQL-backed job store over `upload_jobs`, `upload_job_events` and
/// `upload_job_results`
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn append_event(
        tx: &mut Transaction<'_, Postgres>,
        job: &UploadJob,
        message: Option<&str>,
    ) -> IngestResult<()> {
        // The event shares the job's updated_at so both clocks stay monotonic.
        sqlx::query(
            r#"
            INSERT INTO upload_job_events (job_id, status, message, event_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(message)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn job_exists(&self, job_id: Uuid) -> IngestResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM upload_jobs WHERE job_id = $1)")
                .bind(job_id)
                .fetch_one(&*self.pool)
                .await?;
        Ok(exists)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[tracing::instrument(skip(self, job), fields(filename = %job.original_filename))]
    async fn create(&self, job: &NewJob) -> IngestResult<UploadJob> {
        let file_size = job
            .file_size
            .map(|size| to_db_count(size, "file_size"))
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO upload_jobs (
                job_id, original_filename, workbook_type, workbook_name,
                worksheet_name, file_size, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&job.original_filename)
        .bind(&job.workbook_type)
        .bind(&job.workbook_name)
        .bind(&job.worksheet_name)
        .bind(file_size)
        .bind(JobStatus::Queued.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let created = UploadJob::try_from(row)?;
        Self::append_event(&mut tx, &created, Some(QUEUED_MESSAGE)).await?;
        tx.commit().await?;

        tracing::info!(job_id = %created.job_id, "Upload job created");
        Ok(created)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: Option<&str>,
    ) -> IngestResult<UploadJob> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM upload_jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current: JobStatus = current
            .ok_or_else(|| IngestError::NotFound(format!("upload job {job_id}")))?
            .parse()?;

        if !current.can_transition_to(status) {
            return Err(IngestError::InvalidTransition {
                job_id,
                from: current,
                to: status,
            });
        }

        let row: JobRow = sqlx::query_as(&format!(
            r#"
            UPDATE upload_jobs
            SET status = $2, updated_at = GREATEST(NOW(), updated_at)
            WHERE job_id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let updated = UploadJob::try_from(row)?;
        Self::append_event(&mut tx, &updated, message).await?;
        tx.commit().await?;

        tracing::debug!(job_id = %job_id, from = %current, to = %status, "Job status updated");
        Ok(updated)
    }

    async fn record_results(
        &self,
        job_id: Uuid,
        update: &ResultUpdate,
    ) -> IngestResult<UploadJobResult> {
        update.counts.check()?;

        if !self.job_exists(job_id).await? {
            return Err(IngestError::NotFound(format!("upload job {job_id}")));
        }

        let summary = update
            .validation_summary
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        // Rows that already hold these values are left untouched, so a
        // repeated call does not even move updated_at.
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO upload_job_results (
                job_id, total_rows, processed_rows, successful_rows, rejected_rows,
                normalized_table_name, coverage_metadata, validation_summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (job_id) DO UPDATE SET
                total_rows = EXCLUDED.total_rows,
                processed_rows = EXCLUDED.processed_rows,
                successful_rows = EXCLUDED.successful_rows,
                rejected_rows = EXCLUDED.rejected_rows,
                normalized_table_name = EXCLUDED.normalized_table_name,
                coverage_metadata = EXCLUDED.coverage_metadata,
                validation_summary = EXCLUDED.validation_summary,
                updated_at = GREATEST(NOW(), upload_job_results.updated_at)
            WHERE (
                upload_job_results.total_rows, upload_job_results.processed_rows,
                upload_job_results.successful_rows, upload_job_results.rejected_rows,
                upload_job_results.normalized_table_name,
                upload_job_results.coverage_metadata,
                upload_job_results.validation_summary
            ) IS DISTINCT FROM (
                EXCLUDED.total_rows, EXCLUDED.processed_rows,
                EXCLUDED.successful_rows, EXCLUDED.rejected_rows,
                EXCLUDED.normalized_table_name, EXCLUDED.coverage_metadata,
                EXCLUDED.validation_summary
            )
            RETURNING {RESULT_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(to_db_count(update.counts.total_rows, "total_rows")?)
        .bind(to_db_count(update.counts.processed_rows, "processed_rows")?)
        .bind(to_db_count(update.counts.successful_rows, "successful_rows")?)
        .bind(to_db_count(update.counts.rejected_rows, "rejected_rows")?)
        .bind(&update.normalized_table)
        .bind(&update.coverage)
        .bind(summary)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            Some(row) => UploadJobResult::try_from(row),
            None => self.get_result(job_id).await?.ok_or_else(|| {
                IngestError::IntegrityError(format!("result for job {job_id} vanished"))
            }),
        }
    }

    async fn save_rejected_rows_path(&self, job_id: Uuid, path: &str) -> IngestResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE upload_job_results
            SET rejected_rows_path = $2, updated_at = GREATEST(NOW(), updated_at)
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(path)
        .execute(&*self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            if !self.job_exists(job_id).await? {
                return Err(IngestError::NotFound(format!("upload job {job_id}")));
            }
            return Err(IngestError::IntegrityError(format!(
                "job {job_id} has no recorded results to attach rejected rows to"
            )));
        }

        Ok(())
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        limit: Option<usize>,
    ) -> IngestResult<Vec<UploadJobEvent>> {
        if !self.job_exists(job_id).await? {
            return Err(IngestError::NotFound(format!("upload job {job_id}")));
        }

        let rows: Vec<EventRow> = match limit {
            Some(limit) => {
                let limit = i64::try_from(limit).unwrap_or(i64::MAX);
                sqlx::query_as(
                    r#"
                    SELECT event_id, job_id, status, message, event_at
                    FROM (
                        SELECT event_id, job_id, status, message, event_at
                        FROM upload_job_events
                        WHERE job_id = $1
                        ORDER BY event_id DESC
                        LIMIT $2
                    ) latest
                    ORDER BY event_id ASC
                    "#,
                )
                .bind(job_id)
                .bind(limit)
                .fetch_all(&*self.pool)
                .await?
            },
            None => {
                sqlx::query_as(
                    r#"
                    SELECT event_id, job_id, status, message, event_at
                    FROM upload_job_events
                    WHERE job_id = $1
                    ORDER BY event_id ASC
                    "#,
                )
                .bind(job_id)
                .fetch_all(&*self.pool)
                .await?
            },
        };

        rows.into_iter().map(UploadJobEvent::try_from).collect()
    }

    async fn get_job(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM upload_jobs WHERE job_id = $1"))
                .bind(job_id)
                .fetch_optional(&*self.pool)
                .await?;

        row.ok_or_else(|| IngestError::NotFound(format!("upload job {job_id}")))?
            .try_into()
    }

    async fn get_result(&self, job_id: Uuid) -> IngestResult<Option<UploadJobResult>> {
        let row: Option<ResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM upload_job_results WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(UploadJobResult::try_from).transpose()
    }

    async fn list_recent_jobs(&self, limit: Option<usize>) -> IngestResult<Vec<UploadJob>> {
        let limit = page_size(limit) as i64;

        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM upload_jobs
            ORDER BY created_at DESC, job_id DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(UploadJob::try_from).collect()
    }
}
