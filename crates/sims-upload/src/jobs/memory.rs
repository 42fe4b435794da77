//! In-process job store for tests and dry runs

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::JobStore;
use super::types::{
    page_size, JobStatus, NewJob, ResultUpdate, UploadJob, UploadJobEvent, UploadJobResult,
    QUEUED_MESSAGE,
};
use crate::error::{IngestError, IngestResult};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, UploadJob>,
    /// Creation order, for newest-first listings
    order: Vec<Uuid>,
    events: Vec<UploadJobEvent>,
    results: HashMap<Uuid, UploadJobResult>,
    next_event_id: i64,
}

impl State {
    fn job_mut(&mut self, job_id: Uuid) -> IngestResult<&mut UploadJob> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| IngestError::NotFound(format!("upload job {job_id}")))
    }

    fn push_event(&mut self, job: &UploadJob, message: Option<&str>) {
        self.next_event_id += 1;
        self.events.push(UploadJobEvent {
            event_id: self.next_event_id,
            job_id: job.job_id,
            status: job.status,
            message: message.map(str::to_string),
            event_at: job.updated_at,
        });
    }
}

/// Job store held in memory behind a single lock
///
/// Each operation holds the lock for its whole duration, which gives the same
/// status-plus-event atomicity as the database transaction.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &NewJob) -> IngestResult<UploadJob> {
        let now = Utc::now();
        let file_size = job
            .file_size
            .map(|size| super::types::to_db_count(size, "file_size"))
            .transpose()?;

        let created = UploadJob {
            job_id: Uuid::new_v4(),
            original_filename: job.original_filename.clone(),
            workbook_type: job.workbook_type.clone(),
            workbook_name: job.workbook_name.clone(),
            worksheet_name: job.worksheet_name.clone(),
            file_size,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        state.jobs.insert(created.job_id, created.clone());
        state.order.push(created.job_id);
        state.push_event(&created, Some(QUEUED_MESSAGE));

        Ok(created)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: Option<&str>,
    ) -> IngestResult<UploadJob> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;

        if !job.status.can_transition_to(status) {
            return Err(IngestError::InvalidTransition {
                job_id,
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        job.updated_at = Utc::now().max(job.updated_at);
        let updated = job.clone();
        state.push_event(&updated, message);

        Ok(updated)
    }

    async fn record_results(
        &self,
        job_id: Uuid,
        update: &ResultUpdate,
    ) -> IngestResult<UploadJobResult> {
        update.counts.check()?;

        let mut state = self.state.lock().await;
        state.job_mut(job_id)?;
        let now = Utc::now();

        let stored = state
            .results
            .entry(job_id)
            .and_modify(|existing| {
                if !existing.matches(update) {
                    existing.counts = update.counts;
                    existing.normalized_table_name = update.normalized_table.clone();
                    existing.coverage_metadata = update.coverage.clone();
                    existing.validation_summary = update.validation_summary.clone();
                    existing.updated_at = now.max(existing.updated_at);
                }
            })
            .or_insert_with(|| UploadJobResult {
                job_id,
                counts: update.counts,
                normalized_table_name: update.normalized_table.clone(),
                rejected_rows_path: None,
                coverage_metadata: update.coverage.clone(),
                validation_summary: update.validation_summary.clone(),
                created_at: now,
                updated_at: now,
            });

        Ok(stored.clone())
    }

    async fn save_rejected_rows_path(&self, job_id: Uuid, path: &str) -> IngestResult<()> {
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?;

        let result = state.results.get_mut(&job_id).ok_or_else(|| {
            IngestError::IntegrityError(format!(
                "job {job_id} has no recorded results to attach rejected rows to"
            ))
        })?;
        result.rejected_rows_path = Some(path.to_string());
        result.updated_at = Utc::now().max(result.updated_at);

        Ok(())
    }

    async fn list_events(
        &self,
        job_id: Uuid,
        limit: Option<usize>,
    ) -> IngestResult<Vec<UploadJobEvent>> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job_id) {
            return Err(IngestError::NotFound(format!("upload job {job_id}")));
        }

        let events: Vec<UploadJobEvent> = state
            .events
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect();

        let skip = limit.map_or(0, |limit| events.len().saturating_sub(limit));
        Ok(events.into_iter().skip(skip).collect())
    }

    async fn get_job(&self, job_id: Uuid) -> IngestResult<UploadJob> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(format!("upload job {job_id}")))
    }

    async fn get_result(&self, job_id: Uuid) -> IngestResult<Option<UploadJobResult>> {
        let state = self.state.lock().await;
        Ok(state.results.get(&job_id).cloned())
    }

    async fn list_recent_jobs(&self, limit: Option<usize>) -> IngestResult<Vec<UploadJob>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .rev()
            .take(page_size(limit))
            .filter_map(|job_id| state.jobs.get(job_id).cloned())
            .collect())
    }
}
