//! Error taxonomy for the upload pipeline
//!
//! A duplicate workbook is not an error: the staging loader reports it as
//! [`StagingOutcome::Duplicate`](crate::ingest::staging::StagingOutcome).

use crate::ingest::overlap::OverlapReport;
use crate::ingest::validation::ValidationSummary;
use crate::jobs::JobStatus;
use thiserror::Error;
use uuid::Uuid;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Required headers absent after cleaning, in configured order
    #[error("Missing required column(s): {}", .missing.join(", "))]
    MissingColumns { sheet: String, missing: Vec<String> },

    /// Admission rejected before any job was created
    #[error("{0}")]
    LimitExceeded(String),

    #[error("{0}")]
    OverlapConflict(OverlapReport),

    #[error("{0}")]
    ValidationFailure(ValidationSummary),

    #[error("Integrity error: {0}")]
    IntegrityError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("No ingest configuration for workbook type '{workbook_type}', sheet '{sheet}'")]
    UnknownSheet { workbook_type: String, sheet: String },

    #[error("Invalid ingest configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unsupported upload: {0}")]
    UnsupportedFile(String),

    #[error("Workbook error: {0}")]
    Workbook(String),

    #[error("Timed out waiting for schema lock on {table}")]
    LockTimeout { table: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] sims_common::CommonError),
}

impl IngestError {
    /// Short machine-readable name, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MissingColumns { .. } => "missing_columns",
            IngestError::LimitExceeded(_) => "limit_exceeded",
            IngestError::OverlapConflict(_) => "overlap_conflict",
            IngestError::ValidationFailure(_) => "validation_failure",
            IngestError::IntegrityError(_) => "integrity_error",
            IngestError::NotFound(_) => "not_found",
            IngestError::InvalidTransition { .. } => "invalid_transition",
            IngestError::UnknownSheet { .. } => "unknown_sheet",
            IngestError::InvalidConfig(_) => "invalid_config",
            IngestError::InvalidIdentifier(_) => "invalid_identifier",
            IngestError::UnsupportedFile(_) => "unsupported_file",
            IngestError::Workbook(_) => "workbook",
            IngestError::LockTimeout { .. } => "lock_timeout",
            IngestError::Queue(_) => "queue",
            IngestError::Csv(_) => "csv",
            IngestError::Database(_) => "database",
            IngestError::Migration(_) => "migration",
            IngestError::Io(_) => "io",
            IngestError::Serialization(_) => "serialization",
            IngestError::Common(_) => "common",
        }
    }
}

impl From<calamine::Error> for IngestError {
    fn from(err: calamine::Error) -> Self {
        IngestError::Workbook(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_columns_message_lists_columns_in_order() {
        let err = IngestError::MissingColumns {
            sheet: "Sheet1".to_string(),
            missing: vec!["date".to_string(), "teacher".to_string()],
        };
        assert_eq!(err.to_string(), "Missing required column(s): date, teacher");
        assert_eq!(err.kind(), "missing_columns");
    }

    #[test]
    fn test_invalid_transition_message() {
        let job_id = Uuid::nil();
        let err = IngestError::InvalidTransition {
            job_id,
            from: JobStatus::Loaded,
            to: JobStatus::Parsing,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid status transition for job {job_id}: Loaded -> Parsing")
        );
    }
}
