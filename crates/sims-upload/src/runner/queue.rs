//! Durable work queue
//!
//! Workers claim messages with `FOR UPDATE SKIP LOCKED`, so any number of
//! worker processes can share one queue table without double processing.
//! Start order across workers is best effort.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::ingest::pipeline::PipelineRequest;

pub const DEFAULT_QUEUE_NAME: &str = "sims_uploads";

/// Queue payload: the job and everything the orchestrator needs to run it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub request: PipelineRequest,
}

/// Proof of submission returned to the enqueue caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHandle {
    pub message_id: i64,
    pub queue: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub message_id: i64,
    pub attempts: i32,
    pub job: QueuedJob,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, job: &QueuedJob) -> IngestResult<QueueHandle>;

    /// Next pending message, marked running for `worker_id`
    async fn claim(&self, worker_id: &str) -> IngestResult<Option<ClaimedJob>>;

    async fn complete(&self, message_id: i64) -> IngestResult<()>;

    async fn fail(&self, message_id: i64, error: &str) -> IngestResult<()>;

    /// Return messages claimed longer than `older_than` ago to pending
    async fn reclaim_stale(&self, older_than: Duration) -> IngestResult<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Running,
    Done,
    Failed,
}

impl MessageState {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Pending => "pending",
            MessageState::Running => "running",
            MessageState::Done => "done",
            MessageState::Failed => "failed",
        }
    }
}

/// `upload_queue` table
pub struct PgJobQueue {
    pool: Arc<PgPool>,
    name: String,
}

impl PgJobQueue {
    pub fn new(pool: Arc<PgPool>, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    async fn finish(
        &self,
        message_id: i64,
        state: MessageState,
        error: Option<&str>,
    ) -> IngestResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE upload_queue
            SET status = $2, last_error = $3, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(state.as_str())
        .bind(error)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::NotFound(format!("queue message {message_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: &QueuedJob) -> IngestResult<QueueHandle> {
        let payload = serde_json::to_value(job)?;
        let message_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO upload_queue (queue_name, job_id, payload, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&self.name)
        .bind(job.job_id)
        .bind(payload)
        .bind(MessageState::Pending.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| IngestError::Queue(format!("Failed to submit job {}: {e}", job.job_id)))?;

        Ok(QueueHandle {
            message_id,
            queue: self.name.clone(),
        })
    }

    async fn claim(&self, worker_id: &str) -> IngestResult<Option<ClaimedJob>> {
        let claimed: Option<(i64, i32, serde_json::Value)> = sqlx::query_as(
            r#"
            UPDATE upload_queue
            SET status = 'running', worker_id = $2, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM upload_queue
                WHERE queue_name = $1 AND status = 'pending'
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, attempts, payload
            "#,
        )
        .bind(&self.name)
        .bind(worker_id)
        .fetch_optional(&*self.pool)
        .await?;

        let Some((message_id, attempts, payload)) = claimed else {
            return Ok(None);
        };

        match serde_json::from_value::<QueuedJob>(payload) {
            Ok(job) => Ok(Some(ClaimedJob {
                message_id,
                attempts,
                job,
            })),
            Err(err) => {
                // An unreadable payload can never succeed; park it
                self.finish(message_id, MessageState::Failed, Some(&err.to_string()))
                    .await?;
                Err(IngestError::Queue(format!(
                    "Queue message {message_id} has an invalid payload: {err}"
                )))
            },
        }
    }

    async fn complete(&self, message_id: i64) -> IngestResult<()> {
        self.finish(message_id, MessageState::Done, None).await
    }

    async fn fail(&self, message_id: i64, error: &str) -> IngestResult<()> {
        self.finish(message_id, MessageState::Failed, Some(error)).await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> IngestResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE upload_queue
            SET status = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE queue_name = $1
              AND status = 'running'
              AND claimed_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(&self.name)
        .bind(older_than.as_secs_f64())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug)]
struct MemoryMessage {
    job: QueuedJob,
    state: MessageState,
    attempts: i32,
    claimed_at: Option<tokio::time::Instant>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    messages: BTreeMap<i64, MemoryMessage>,
    next_id: i64,
}

/// Process-local queue for tests and single-process runs
#[derive(Debug)]
pub struct MemoryJobQueue {
    name: String,
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    pub async fn count(&self, state: MessageState) -> usize {
        let guard = self.state.lock().await;
        guard.messages.values().filter(|m| m.state == state).count()
    }

    pub async fn last_error(&self, message_id: i64) -> Option<String> {
        let guard = self.state.lock().await;
        guard
            .messages
            .get(&message_id)
            .and_then(|m| m.last_error.clone())
    }

    async fn finish(
        &self,
        message_id: i64,
        state: MessageState,
        error: Option<&str>,
    ) -> IngestResult<()> {
        let mut guard = self.state.lock().await;
        let message = guard
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| IngestError::NotFound(format!("queue message {message_id}")))?;
        message.state = state;
        message.last_error = error.map(str::to_string);
        Ok(())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_NAME)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, job: &QueuedJob) -> IngestResult<QueueHandle> {
        let mut guard = self.state.lock().await;
        guard.next_id += 1;
        let message_id = guard.next_id;
        guard.messages.insert(
            message_id,
            MemoryMessage {
                job: job.clone(),
                state: MessageState::Pending,
                attempts: 0,
                claimed_at: None,
                last_error: None,
            },
        );

        Ok(QueueHandle {
            message_id,
            queue: self.name.clone(),
        })
    }

    async fn claim(&self, worker_id: &str) -> IngestResult<Option<ClaimedJob>> {
        tracing::trace!(worker_id, "Claiming from memory queue");
        let mut guard = self.state.lock().await;
        let Some((&message_id, message)) = guard
            .messages
            .iter_mut()
            .find(|(_, m)| m.state == MessageState::Pending)
        else {
            return Ok(None);
        };

        message.state = MessageState::Running;
        message.attempts += 1;
        message.claimed_at = Some(tokio::time::Instant::now());

        Ok(Some(ClaimedJob {
            message_id,
            attempts: message.attempts,
            job: message.job.clone(),
        }))
    }

    async fn complete(&self, message_id: i64) -> IngestResult<()> {
        self.finish(message_id, MessageState::Done, None).await
    }

    async fn fail(&self, message_id: i64, error: &str) -> IngestResult<()> {
        self.finish(message_id, MessageState::Failed, Some(error)).await
    }

    async fn reclaim_stale(&self, older_than: Duration) -> IngestResult<u64> {
        let mut guard = self.state.lock().await;
        let now = tokio::time::Instant::now();
        let mut reclaimed = 0;
        for message in guard.messages.values_mut() {
            let stale = message.state == MessageState::Running
                && message
                    .claimed_at
                    .is_some_and(|at| now.duration_since(at) >= older_than);
            if stale {
                message.state = MessageState::Pending;
                message.claimed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}
