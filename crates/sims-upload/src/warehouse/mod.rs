//! Storage seam for business tables
//!
//! Staging tables, normalized tables and overlap lookups sit behind the
//! [`Warehouse`] trait so the pipeline runs unchanged against PostgreSQL or
//! the in-memory backend used by tests and dry runs.

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sims_common::fingerprint::Fingerprint;
use std::time::Duration;
use uuid::Uuid;

use crate::error::IngestResult;
use crate::ingest::normalizer::CanonicalRow;
use crate::ingest::schema::{ColumnSpec, MetadataColumn, SchemaChange};
use crate::ingest::staging::{StagedRow, StagingOutcome};
use crate::ingest::validation::NormalizedRow;

/// One workbook's canonical rows bound for a staging table
#[derive(Debug, Clone, Copy)]
pub struct StagingBatch<'a> {
    pub table: &'a str,
    pub fingerprint: &'a Fingerprint,
    pub batch_id: &'a str,
    pub source_year: Option<i32>,
    pub ingested_at: DateTime<Utc>,
    pub columns: &'a [String],
    pub rows: &'a [CanonicalRow],
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaRequest<'a> {
    pub workbook_type: &'a str,
    pub table: &'a str,
    pub metadata: &'a [MetadataColumn],
    pub columns: &'a [ColumnSpec],
    pub lock_timeout: Duration,
}

/// Lookup of committed time ranges, optionally restricted to identity keys
#[derive(Debug, Clone, Copy)]
pub struct RangeQuery<'a> {
    pub table: &'a str,
    pub record_id_column: &'a str,
    pub start_column: &'a str,
    pub end_column: Option<&'a str>,
    pub key_columns: &'a [String],
    /// Key tuples of the incoming rows; ignored when `key_columns` is empty
    pub keys: &'a [Vec<Option<String>>],
}

/// A committed record as text, parsed by the overlap detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRecord {
    pub record_id: i64,
    pub key: Vec<Option<String>>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Existing records deleted in the same transaction as the insert
#[derive(Debug, Clone, Copy)]
pub struct Supersede<'a> {
    pub table: &'a str,
    pub record_id_column: &'a str,
    pub record_ids: &'a [i64],
}

/// Everything a pipeline run writes once validation has decided
#[derive(Debug, Clone, Copy)]
pub struct NormalizedCommit<'a> {
    pub job_id: Uuid,
    pub staging_table: &'a str,
    pub normalized_table: &'a str,
    pub metadata: &'a [MetadataColumn],
    pub columns: &'a [ColumnSpec],
    pub rows: &'a [NormalizedRow],
    /// Staging ids stamped `processed_at`; every one must still be unprocessed
    pub processed: &'a [i64],
    pub supersede: Option<Supersede<'a>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub inserted: u64,
    pub superseded: u64,
    pub processed: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Stage rows unless the fingerprint is already present in `batch.table`
    async fn stage_rows(&self, batch: &StagingBatch<'_>) -> IngestResult<StagingOutcome>;

    /// Unprocessed rows for `fingerprint`, ordered by sheet row number
    async fn staged_rows(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
    ) -> IngestResult<Vec<StagedRow>>;

    /// Create the normalized table or add and widen columns
    async fn ensure_columns(&self, request: &SchemaRequest<'_>) -> IngestResult<SchemaChange>;

    /// Records of the target table; a missing table has none
    async fn existing_ranges(&self, query: &RangeQuery<'_>) -> IngestResult<Vec<ExistingRecord>>;

    /// Supersede, insert and stamp processed rows atomically
    async fn commit_normalized(&self, commit: &NormalizedCommit<'_>) -> IngestResult<CommitReport>;
}

/// Metadata value of a normalized row, as text
pub(crate) fn metadata_text(
    column: MetadataColumn,
    row: &NormalizedRow,
    job_id: Uuid,
) -> Option<String> {
    match column {
        MetadataColumn::RawId => Some(row.raw_id.to_string()),
        MetadataColumn::JobId => Some(job_id.to_string()),
        MetadataColumn::FileHash => Some(row.file_hash.clone()),
        MetadataColumn::BatchId => Some(row.batch_id.clone()),
        MetadataColumn::SourceYear => row.source_year.map(|y| y.to_string()),
        MetadataColumn::IngestedAt => Some(row.ingested_at.to_rfc3339()),
    }
}
