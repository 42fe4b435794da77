//! Job runner and queue adapter
//!
//! [`JobRunner::enqueue`] applies admission limits, stores the upload, creates
//! the job and hands it to the queue. Workers pick it up from there, see
//! [`worker::Worker`].

pub mod admission;
pub mod queue;
pub mod storage;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

pub use admission::AdmissionLimits;
pub use queue::{JobQueue, MemoryJobQueue, PgJobQueue, QueueHandle, QueuedJob};
pub use storage::UploadStorage;
pub use worker::{Worker, WorkerConfig, WorkerStats};

use crate::error::{IngestError, IngestResult};
use crate::ingest::overlap::ConflictResolution;
use crate::ingest::pipeline::{PipelineOrchestrator, PipelineReport, PipelineRequest};
use crate::ingest::workbook::WorkbookReader;
use crate::jobs::{JobStatus, JobStore, NewJob, UploadJob};

/// One upload to admit
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    pub workbook_path: PathBuf,
    /// Defaults to the file name of `workbook_path`
    pub original_filename: Option<String>,
    pub workbook_type: String,
    pub sheet_name: String,
    pub workbook_name: Option<String>,
    pub source_year: Option<i32>,
    pub batch_id: Option<String>,
    pub conflict_resolution: Option<ConflictResolution>,
    /// Read from the file when not reported
    pub file_size: Option<u64>,
    /// Estimated from the sheet when not reported and a row limit applies
    pub row_count: Option<u64>,
    pub limits: Option<AdmissionLimits>,
}

impl EnqueueRequest {
    fn original_filename(&self) -> String {
        self.original_filename.clone().unwrap_or_else(|| {
            self.workbook_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| self.workbook_path.display().to_string())
        })
    }
}

pub struct JobRunner {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    reader: Arc<dyn WorkbookReader>,
    storage: Option<UploadStorage>,
    limits: AdmissionLimits,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
        reader: Arc<dyn WorkbookReader>,
        limits: AdmissionLimits,
    ) -> Self {
        Self {
            jobs,
            queue,
            orchestrator,
            reader,
            storage: None,
            limits,
        }
    }

    /// Copy admitted uploads into `storage` before the job is created
    pub fn with_storage(mut self, storage: UploadStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    /// Admit an upload and queue it; returns as soon as the message is pushed
    #[tracing::instrument(
        skip(self, request),
        fields(workbook_type = %request.workbook_type, sheet = %request.sheet_name)
    )]
    pub async fn enqueue(&self, request: &EnqueueRequest) -> IngestResult<(UploadJob, QueueHandle)> {
        let (job, pipeline) = self.admit(request).await?;

        let queued = QueuedJob {
            job_id: job.job_id,
            request: pipeline,
        };
        match self.queue.push(&queued).await {
            Ok(handle) => {
                tracing::info!(
                    job_id = %job.job_id,
                    message_id = handle.message_id,
                    queue = %handle.queue,
                    "Job queued"
                );
                Ok((job, handle))
            },
            Err(err) => {
                let message = format!("Queue submission failed: {err}");
                tracing::error!(job_id = %job.job_id, error = %err, "Queue submission failed");
                if let Err(store_err) = self
                    .jobs
                    .set_status(job.job_id, JobStatus::Errors, Some(&message))
                    .await
                {
                    tracing::error!(job_id = %job.job_id, error = %store_err, "Failed to record submission failure");
                }
                Err(err)
            },
        }
    }

    /// Admit an upload and run it in the calling task
    pub async fn run_now(&self, request: &EnqueueRequest) -> IngestResult<PipelineReport> {
        let (job, pipeline) = self.admit(request).await?;
        self.orchestrator.run(job.job_id, &pipeline).await
    }

    /// Checks limits, stores the file and creates the job. Nothing durable
    /// is written until every check has passed.
    async fn admit(&self, request: &EnqueueRequest) -> IngestResult<(UploadJob, PipelineRequest)> {
        let original_filename = request.original_filename();
        admission::check_extension(&original_filename)?;

        let limits = request.limits.unwrap_or_default().or(self.limits);

        let file_size = match request.file_size {
            Some(size) => size,
            None => tokio::fs::metadata(&request.workbook_path).await?.len(),
        };
        limits.check_file_size(Some(file_size))?;

        let row_count = match (request.row_count, limits.max_rows) {
            (Some(rows), _) => Some(rows),
            (None, Some(_)) => self.estimate_rows(request).await,
            (None, None) => None,
        };
        limits.check_rows(row_count)?;

        let workbook_path = match &self.storage {
            Some(storage) => storage.store(&request.workbook_path, &original_filename).await?,
            None => request.workbook_path.clone(),
        };

        let job = self
            .jobs
            .create(&NewJob {
                original_filename,
                workbook_type: request.workbook_type.clone(),
                workbook_name: request.workbook_name.clone(),
                worksheet_name: Some(request.sheet_name.clone()),
                file_size: Some(file_size),
            })
            .await?;

        let pipeline = PipelineRequest {
            workbook_path,
            workbook_type: request.workbook_type.clone(),
            sheet_name: request.sheet_name.clone(),
            source_year: request.source_year,
            batch_id: request.batch_id.clone(),
            conflict_resolution: request.conflict_resolution,
        };

        Ok((job, pipeline))
    }

    /// Data rows of the requested sheet, or `None` if it cannot be read here.
    /// An unreadable sheet fails later, inside the job.
    async fn estimate_rows(&self, request: &EnqueueRequest) -> Option<u64> {
        let reader = Arc::clone(&self.reader);
        let path = request.workbook_path.clone();
        let sheet = request.sheet_name.clone();

        let estimate = tokio::task::spawn_blocking(move || {
            reader
                .read_sheet(&path, &sheet)
                .map(|raw| raw.rows.len() as u64)
        })
        .await
        .map_err(|e| IngestError::Workbook(format!("Row estimate task failed: {e}")));

        match estimate {
            Ok(Ok(rows)) => Some(rows),
            Ok(Err(err)) | Err(err) => {
                tracing::debug!(error = %err, "Row count estimate unavailable");
                None
            },
        }
    }
}
