//! Value types returned by the job store

use crate::error::{IngestError, IngestResult};
use crate::ingest::validation::ValidationSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_RECENT_JOBS_LIMIT: usize = 20;
pub const MAX_RECENT_JOBS_LIMIT: usize = 100;

/// Message written with the first event of every job
pub const QUEUED_MESSAGE: &str = "Queued for processing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Parsing,
    Validating,
    Loaded,
    Errors,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Parsing => "Parsing",
            JobStatus::Validating => "Validating",
            JobStatus::Loaded => "Loaded",
            JobStatus::Errors => "Errors",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Loaded | JobStatus::Errors)
    }

    /// Edges of `Queued -> Parsing -> Validating -> Loaded`, plus any live
    /// state to `Errors`. Same-state re-entry is allowed for live states only.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (Loaded | Errors, _) => false,
            (current, next) if current == next => true,
            (_, Errors) => true,
            (Queued, Parsing) | (Parsing, Validating) | (Validating, Loaded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s {
            "Queued" => Ok(JobStatus::Queued),
            "Parsing" => Ok(JobStatus::Parsing),
            "Validating" => Ok(JobStatus::Validating),
            "Loaded" => Ok(JobStatus::Loaded),
            "Errors" => Ok(JobStatus::Errors),
            other => Err(IngestError::IntegrityError(format!(
                "Unknown job status '{other}'"
            ))),
        }
    }
}

/// Attributes supplied when a job is created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub original_filename: String,
    pub workbook_type: String,
    pub workbook_name: Option<String>,
    pub worksheet_name: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub job_id: Uuid,
    pub original_filename: String,
    pub workbook_type: String,
    pub workbook_name: Option<String>,
    pub worksheet_name: Option<String>,
    pub file_size: Option<i64>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJobEvent {
    pub event_id: i64,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: Option<String>,
    pub event_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub rejected_rows: u64,
}

impl ResultCounts {
    pub fn new(total_rows: u64, successful_rows: u64, rejected_rows: u64) -> IngestResult<Self> {
        let processed_rows = successful_rows.checked_add(rejected_rows).ok_or_else(|| {
            IngestError::IntegrityError(format!(
                "successful_rows ({successful_rows}) + rejected_rows ({rejected_rows}) overflows"
            ))
        })?;

        Ok(Self {
            total_rows,
            processed_rows,
            successful_rows,
            rejected_rows,
        })
    }

    /// `successful + rejected == processed <= total`
    pub fn check(&self) -> IngestResult<()> {
        let sum = self.successful_rows.checked_add(self.rejected_rows);
        if sum != Some(self.processed_rows) {
            return Err(IngestError::IntegrityError(format!(
                "successful_rows ({}) + rejected_rows ({}) != processed_rows ({})",
                self.successful_rows, self.rejected_rows, self.processed_rows
            )));
        }
        if self.processed_rows > self.total_rows {
            return Err(IngestError::IntegrityError(format!(
                "processed_rows ({}) exceeds total_rows ({})",
                self.processed_rows, self.total_rows
            )));
        }
        Ok(())
    }
}

/// Aggregate fields written by `record_results`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub counts: ResultCounts,
    pub normalized_table: Option<String>,
    pub coverage: serde_json::Value,
    pub validation_summary: Option<ValidationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJobResult {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub counts: ResultCounts,
    pub normalized_table_name: Option<String>,
    pub rejected_rows_path: Option<String>,
    pub coverage_metadata: serde_json::Value,
    pub validation_summary: Option<ValidationSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadJobResult {
    pub(crate) fn matches(&self, update: &ResultUpdate) -> bool {
        self.counts == update.counts
            && self.normalized_table_name == update.normalized_table
            && self.coverage_metadata == update.coverage
            && self.validation_summary == update.validation_summary
    }
}

/// Job plus its aggregate result, the polling read model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub job: UploadJob,
    pub result: Option<UploadJobResult>,
}

/// Page size for recent-job listings, clamped to `1..=MAX_RECENT_JOBS_LIMIT`
pub fn page_size(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_RECENT_JOBS_LIMIT)
        .clamp(1, MAX_RECENT_JOBS_LIMIT)
}

pub(crate) fn to_db_count(value: u64, field: &str) -> IngestResult<i64> {
    i64::try_from(value)
        .map_err(|_| IngestError::IntegrityError(format!("{field} ({value}) is out of range")))
}

pub(crate) fn from_db_count(value: i64, field: &str) -> IngestResult<u64> {
    u64::try_from(value)
        .map_err(|_| IngestError::IntegrityError(format!("{field} ({value}) is negative")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Queued.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Loaded));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for status in [Queued, Parsing, Validating] {
            assert!(status.can_transition_to(Errors), "{status} -> Errors");
        }
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!Queued.can_transition_to(Validating));
        assert!(!Queued.can_transition_to(Loaded));
        assert!(!Parsing.can_transition_to(Loaded));
        assert!(!Validating.can_transition_to(Parsing));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [Loaded, Errors] {
            assert!(terminal.is_terminal());
            for next in [Queued, Parsing, Validating, Loaded, Errors] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_same_state_reentry_for_live_states() {
        assert!(Parsing.can_transition_to(Parsing));
        assert!(Validating.can_transition_to(Validating));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        assert_eq!("Validating".parse::<JobStatus>().unwrap(), Validating);
        assert!("validating".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_counts_invariant() {
        assert!(ResultCounts::new(10, 8, 2).unwrap().check().is_ok());
        assert!(ResultCounts::new(10, 7, 2).unwrap().check().is_ok());

        let too_many = ResultCounts::new(5, 4, 2).unwrap();
        assert!(matches!(too_many.check(), Err(IngestError::IntegrityError(_))));

        let mismatched = ResultCounts {
            total_rows: 10,
            processed_rows: 10,
            successful_rows: 8,
            rejected_rows: 1,
        };
        assert!(matches!(mismatched.check(), Err(IngestError::IntegrityError(_))));
    }

    #[test]
    fn test_counts_reject_overflow() {
        let overflow = ResultCounts::new(u64::MAX, u64::MAX, 1);
        assert!(matches!(overflow, Err(IngestError::IntegrityError(_))));

        let edge = ResultCounts::new(u64::MAX, u64::MAX - 1, 1).unwrap();
        assert_eq!(edge.processed_rows, u64::MAX);
        assert!(edge.check().is_ok());
    }

    #[test]
    fn test_page_size_bounds() {
        assert_eq!(page_size(None), DEFAULT_RECENT_JOBS_LIMIT);
        assert_eq!(page_size(Some(0)), 1);
        assert_eq!(page_size(Some(500)), MAX_RECENT_JOBS_LIMIT);
        assert_eq!(page_size(Some(42)), 42);
    }
}
