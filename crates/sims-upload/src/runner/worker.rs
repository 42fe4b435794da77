//! Queue worker
//!
//! Claims jobs and runs them through the orchestrator with bounded
//! concurrency. Cancellation is observed only between claims: once cancelled
//! the worker stops claiming and waits for in-flight jobs to reach a terminal
//! status.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::queue::{ClaimedJob, JobQueue};
use crate::config::{
    DEFAULT_WORKER_CONCURRENCY, DEFAULT_WORKER_POLL_INTERVAL_MS, DEFAULT_WORKER_STALE_AFTER_SECS,
};
use crate::error::{IngestError, IngestResult};
use crate::ingest::pipeline::PipelineOrchestrator;
use crate::jobs::JobStatus;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Claims older than this are handed back to the queue at startup
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_INTERVAL_MS),
            stale_after: Duration::from_secs(DEFAULT_WORKER_STALE_AFTER_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub loaded: u64,
    pub errored: u64,
    /// Messages whose job was already terminal, e.g. after a reclaim
    pub skipped: u64,
    pub reclaimed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Finished(JobStatus),
    Skipped,
}

impl WorkerStats {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Finished(JobStatus::Loaded) => self.loaded += 1,
            JobOutcome::Finished(_) => self.errored += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct Worker {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
        config: WorkerConfig,
    ) -> Self {
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        Self {
            worker_id: format!("{hostname}:{}:{}", std::process::id(), &suffix[..8]),
            queue,
            orchestrator,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> IngestResult<WorkerStats> {
        self.drive(shutdown, false).await
    }

    /// Drain the queue, then return
    pub async fn run_until_idle(&self) -> IngestResult<WorkerStats> {
        self.drive(CancellationToken::new(), true).await
    }

    #[tracing::instrument(skip(self, shutdown), fields(worker_id = %self.worker_id, queue = self.queue.name()))]
    async fn drive(&self, shutdown: CancellationToken, stop_when_idle: bool) -> IngestResult<WorkerStats> {
        let mut stats = WorkerStats {
            reclaimed: self.queue.reclaim_stale(self.config.stale_after).await?,
            ..Default::default()
        };
        if stats.reclaimed > 0 {
            tracing::warn!(reclaimed = stats.reclaimed, "Stale queue claims returned to pending");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
        tracing::info!(concurrency = self.config.concurrency, "Worker started");

        loop {
            while let Some(joined) = tasks.try_join_next() {
                record_joined(&mut stats, joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| IngestError::Queue(format!("Worker semaphore closed: {e}")))?,
            };
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.claim(&self.worker_id).await {
                Ok(Some(claimed)) => {
                    stats.claimed += 1;
                    let queue = Arc::clone(&self.queue);
                    let orchestrator = Arc::clone(&self.orchestrator);
                    tasks.spawn(async move {
                        let outcome = process(queue.as_ref(), &orchestrator, claimed).await;
                        drop(permit);
                        outcome
                    });
                },
                Ok(None) => {
                    drop(permit);
                    if stop_when_idle {
                        // Jobs still running may finish; the queue is otherwise empty
                        if tasks.is_empty() {
                            break;
                        }
                        if let Some(joined) = tasks.join_next().await {
                            record_joined(&mut stats, joined);
                        }
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                },
                Err(err) => {
                    drop(permit);
                    tracing::error!(error = %err, "Failed to claim from queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                },
            }
        }

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            record_joined(&mut stats, joined);
        }

        tracing::info!(
            claimed = stats.claimed,
            loaded = stats.loaded,
            errored = stats.errored,
            skipped = stats.skipped,
            "Worker stopped"
        );
        Ok(stats)
    }
}

fn record_joined(stats: &mut WorkerStats, joined: Result<JobOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => stats.record(outcome),
        Err(err) => {
            stats.errored += 1;
            tracing::error!(error = %err, "Worker task panicked");
        },
    }
}

async fn process(
    queue: &dyn JobQueue,
    orchestrator: &PipelineOrchestrator,
    claimed: ClaimedJob,
) -> JobOutcome {
    let job_id = claimed.job.job_id;

    match orchestrator.jobs().get_job(job_id).await {
        Ok(job) if job.status.is_terminal() => {
            tracing::info!(job_id = %job_id, status = %job.status, "Job already finished, dropping message");
            if let Err(err) = queue.complete(claimed.message_id).await {
                tracing::error!(job_id = %job_id, error = %err, "Failed to complete queue message");
            }
            return JobOutcome::Skipped;
        },
        Ok(_) => {},
        Err(err) => {
            tracing::error!(job_id = %job_id, error = %err, "Queued job cannot be loaded");
            if let Err(err) = queue.fail(claimed.message_id, &err.to_string()).await {
                tracing::error!(job_id = %job_id, error = %err, "Failed to mark queue message failed");
            }
            return JobOutcome::Finished(JobStatus::Errors);
        },
    }

    tracing::info!(job_id = %job_id, attempts = claimed.attempts, "Processing job");
    let status = orchestrator.run_queued(job_id, &claimed.job.request).await;

    if let Err(err) = queue.complete(claimed.message_id).await {
        tracing::error!(job_id = %job_id, error = %err, "Failed to complete queue message");
    }

    JobOutcome::Finished(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_count_outcomes() {
        let mut stats = WorkerStats::default();
        stats.record(JobOutcome::Finished(JobStatus::Loaded));
        stats.record(JobOutcome::Finished(JobStatus::Errors));
        stats.record(JobOutcome::Skipped);
        stats.record(JobOutcome::Finished(JobStatus::Loaded));

        assert_eq!(stats.loaded, 2);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stale_after, Duration::from_secs(3600));
    }
}
