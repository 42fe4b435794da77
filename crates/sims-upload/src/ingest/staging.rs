//! Staging loader
//!
//! Canonical rows land in a per-workbook-type staging table, stamped with the
//! workbook fingerprint and ingestion metadata, in one transaction. A
//! fingerprint that is already staged is a no-op, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sims_common::fingerprint::Fingerprint;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::identifiers;
use super::normalizer::CanonicalRow;
use crate::error::IngestResult;
use crate::warehouse::{StagingBatch, Warehouse};

/// Rows per multi-row INSERT statement
pub const STAGING_CHUNK_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StagingOutcome {
    Staged {
        batch_id: String,
        rows: u64,
        ingested_at: DateTime<Utc>,
    },
    /// Rows with this fingerprint were already staged; nothing was inserted
    Duplicate { existing_rows: u64 },
}

impl StagingOutcome {
    pub fn staged_rows(&self) -> u64 {
        match self {
            StagingOutcome::Staged { rows, .. } => *rows,
            StagingOutcome::Duplicate { .. } => 0,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StagingOutcome::Duplicate { .. })
    }
}

/// A staging-table tuple read back for a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub id: i64,
    pub row_number: i64,
    pub file_hash: String,
    pub batch_id: String,
    pub source_year: Option<i32>,
    pub ingested_at: DateTime<Utc>,
    pub values: BTreeMap<String, Option<String>>,
}

impl StagedRow {
    pub fn value(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    /// Values in the given column order
    pub fn values_for(&self, columns: &[String]) -> Vec<Option<String>> {
        columns
            .iter()
            .map(|column| self.value(column).map(str::to_string))
            .collect()
    }
}

/// Staging metadata stamped on every row of one load
#[derive(Debug, Clone)]
pub struct StagingMetadata {
    pub batch_id: String,
    pub source_year: Option<i32>,
    pub ingested_at: DateTime<Utc>,
}

impl StagingMetadata {
    /// Fresh UUID batch id unless the caller supplied one
    pub fn new(batch_id: Option<String>, source_year: Option<i32>) -> Self {
        Self {
            batch_id: batch_id
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source_year,
            ingested_at: Utc::now(),
        }
    }
}

pub struct StagingLoader {
    warehouse: Arc<dyn Warehouse>,
}

impl StagingLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    #[tracing::instrument(skip(self, columns, rows, metadata), fields(rows = rows.len()))]
    pub async fn load(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
        metadata: &StagingMetadata,
        columns: &[String],
        rows: &[CanonicalRow],
    ) -> IngestResult<StagingOutcome> {
        identifiers::validate_table_name(table)?;

        let batch = StagingBatch {
            table,
            fingerprint,
            batch_id: &metadata.batch_id,
            source_year: metadata.source_year,
            ingested_at: metadata.ingested_at,
            columns,
            rows,
        };
        let outcome = self.warehouse.stage_rows(&batch).await?;

        match &outcome {
            StagingOutcome::Staged { rows, batch_id, .. } => {
                tracing::info!(table, %fingerprint, batch_id = %batch_id, rows, "Rows staged");
            },
            StagingOutcome::Duplicate { existing_rows } => {
                tracing::info!(table, %fingerprint, existing_rows, "Duplicate upload, staging skipped");
            },
        }

        Ok(outcome)
    }

    /// Unprocessed staged rows for `fingerprint`, in sheet order
    pub async fn snapshot(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
    ) -> IngestResult<Vec<StagedRow>> {
        identifiers::validate_table_name(table)?;
        self.warehouse.staged_rows(table, fingerprint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;

    fn rows() -> Vec<CanonicalRow> {
        vec![
            CanonicalRow {
                row_number: 2,
                values: vec![Some("2024-01-05".to_string()), Some("Ada".to_string())],
            },
            CanonicalRow {
                row_number: 3,
                values: vec![Some("2024-01-06".to_string()), None],
            },
        ]
    }

    fn columns() -> Vec<String> {
        vec!["date".to_string(), "teacher".to_string()]
    }

    #[tokio::test]
    async fn test_second_load_is_duplicate() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = StagingLoader::new(warehouse.clone());
        let fingerprint = Fingerprint::from_bytes(b"workbook");
        let metadata = StagingMetadata::new(Some("batch-1".to_string()), Some(2024));

        let first = loader
            .load("t_staging", &fingerprint, &metadata, &columns(), &rows())
            .await
            .unwrap();
        assert_eq!(first.staged_rows(), 2);

        let second = loader
            .load("t_staging", &fingerprint, &StagingMetadata::new(None, None), &columns(), &rows())
            .await
            .unwrap();
        assert_eq!(second, StagingOutcome::Duplicate { existing_rows: 2 });
        assert_eq!(warehouse.staging_row_count("t_staging").await, 2);
    }

    #[tokio::test]
    async fn test_same_bytes_other_table_is_staged() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = StagingLoader::new(warehouse);
        let fingerprint = Fingerprint::from_bytes(b"workbook");
        let metadata = StagingMetadata::new(None, None);

        loader
            .load("a_staging", &fingerprint, &metadata, &columns(), &rows())
            .await
            .unwrap();
        let other = loader
            .load("b_staging", &fingerprint, &metadata, &columns(), &rows())
            .await
            .unwrap();
        assert!(!other.is_duplicate());
    }

    #[tokio::test]
    async fn test_snapshot_carries_metadata() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = StagingLoader::new(warehouse);
        let fingerprint = Fingerprint::from_bytes(b"workbook");
        let metadata = StagingMetadata::new(Some("b-7".to_string()), Some(2023));

        loader
            .load("t_staging", &fingerprint, &metadata, &columns(), &rows())
            .await
            .unwrap();
        let snapshot = loader.snapshot("t_staging", &fingerprint).await.unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].row_number, 2);
        assert_eq!(snapshot[0].batch_id, "b-7");
        assert_eq!(snapshot[0].source_year, Some(2023));
        assert_eq!(snapshot[0].file_hash, fingerprint.as_str());
        assert_eq!(snapshot[1].value("teacher"), None);
        assert_eq!(
            snapshot[0].values_for(&columns()),
            vec![Some("2024-01-05".to_string()), Some("Ada".to_string())]
        );
    }

    #[test]
    fn test_blank_batch_id_gets_generated() {
        let metadata = StagingMetadata::new(Some("  ".to_string()), None);
        assert!(uuid::Uuid::parse_str(&metadata.batch_id).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let loader = StagingLoader::new(Arc::new(MemoryWarehouse::new()));
        let fingerprint = Fingerprint::from_bytes(b"x");
        let err = loader
            .load("bad name", &fingerprint, &StagingMetadata::new(None, None), &columns(), &rows())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::IngestError::InvalidIdentifier(_)));
    }
}
