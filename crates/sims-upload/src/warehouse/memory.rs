//! In-memory warehouse for tests and dry runs

use async_trait::async_trait;
use sims_common::fingerprint::Fingerprint;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{
    metadata_text, CommitReport, ExistingRecord, NormalizedCommit, RangeQuery, SchemaRequest,
    StagingBatch, Warehouse,
};
use crate::error::{IngestError, IngestResult};
use crate::ingest::schema::{ColumnType, SchemaChange};
use crate::ingest::staging::{StagedRow, StagingOutcome};

pub type Record = BTreeMap<String, Option<String>>;

#[derive(Debug)]
struct StagingEntry {
    row: StagedRow,
    processed: bool,
}

#[derive(Debug, Default)]
struct Table {
    /// Business columns with their current type
    columns: Vec<(String, ColumnType)>,
    records: Vec<(i64, Record)>,
}

#[derive(Debug, Default)]
struct State {
    staging: HashMap<String, Vec<StagingEntry>>,
    tables: HashMap<String, Table>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn staging_row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.staging.get(table).map_or(0, Vec::len)
    }

    pub async fn unprocessed_row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state
            .staging
            .get(table)
            .map_or(0, |rows| rows.iter().filter(|e| !e.processed).count())
    }

    /// Records of a normalized table, `id` included, in insertion order
    pub async fn records(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| {
                t.records
                    .iter()
                    .map(|(id, record)| {
                        let mut record = record.clone();
                        record.insert("id".to_string(), Some(id.to_string()));
                        record
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn column_types(&self, table: &str) -> Option<Vec<(String, ColumnType)>> {
        let state = self.state.lock().await;
        state.tables.get(table).map(|t| t.columns.clone())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn stage_rows(&self, batch: &StagingBatch<'_>) -> IngestResult<StagingOutcome> {
        let mut state = self.state.lock().await;

        let existing_rows = state.staging.get(batch.table).map_or(0, |rows| {
            rows.iter()
                .filter(|e| e.row.file_hash == batch.fingerprint.as_str())
                .count()
        });
        if existing_rows > 0 {
            return Ok(StagingOutcome::Duplicate {
                existing_rows: existing_rows as u64,
            });
        }

        let mut staged = Vec::with_capacity(batch.rows.len());
        for row in batch.rows {
            let values = batch
                .columns
                .iter()
                .cloned()
                .zip(row.values.iter().cloned())
                .collect();
            staged.push(StagingEntry {
                row: StagedRow {
                    id: state.next_id(),
                    row_number: row.row_number as i64,
                    file_hash: batch.fingerprint.to_string(),
                    batch_id: batch.batch_id.to_string(),
                    source_year: batch.source_year,
                    ingested_at: batch.ingested_at,
                    values,
                },
                processed: false,
            });
        }
        state
            .staging
            .entry(batch.table.to_string())
            .or_default()
            .extend(staged);

        Ok(StagingOutcome::Staged {
            batch_id: batch.batch_id.to_string(),
            rows: batch.rows.len() as u64,
            ingested_at: batch.ingested_at,
        })
    }

    async fn staged_rows(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
    ) -> IngestResult<Vec<StagedRow>> {
        let state = self.state.lock().await;
        let mut rows: Vec<StagedRow> = state
            .staging
            .get(table)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !e.processed && e.row.file_hash == fingerprint.as_str())
                    .map(|e| e.row.clone())
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.row_number, r.id));
        Ok(rows)
    }

    async fn ensure_columns(&self, request: &SchemaRequest<'_>) -> IngestResult<SchemaChange> {
        let mut state = self.state.lock().await;
        let mut change = SchemaChange::default();

        change.created = !state.tables.contains_key(request.table);
        let table = state.tables.entry(request.table.to_string()).or_default();

        for spec in request.columns {
            match table.columns.iter_mut().find(|(name, _)| *name == spec.name) {
                Some((_, current)) => {
                    let widened = current.widen(spec.column_type);
                    if widened != *current {
                        *current = widened;
                        change.widened.push(spec.name.clone());
                    }
                },
                None => {
                    table.columns.push((spec.name.clone(), spec.column_type));
                    if !change.created {
                        change.added.push(spec.name.clone());
                    }
                },
            }
        }

        Ok(change)
    }

    async fn existing_ranges(&self, query: &RangeQuery<'_>) -> IngestResult<Vec<ExistingRecord>> {
        let state = self.state.lock().await;
        let Some(table) = state.tables.get(query.table) else {
            return Ok(Vec::new());
        };

        let wanted: HashSet<&Vec<Option<String>>> = query.keys.iter().collect();
        let records = table
            .records
            .iter()
            .filter_map(|(id, record)| {
                let get = |column: &str| record.get(column).cloned().flatten();
                let key: Vec<Option<String>> =
                    query.key_columns.iter().map(|c| get(c.as_str())).collect();
                if !query.key_columns.is_empty() && !wanted.contains(&key) {
                    return None;
                }
                let record_id = if query.record_id_column == "id" {
                    *id
                } else {
                    get(query.record_id_column)?.parse().ok()?
                };
                Some(ExistingRecord {
                    record_id,
                    key,
                    start: get(query.start_column),
                    end: query.end_column.and_then(get),
                })
            })
            .collect();

        Ok(records)
    }

    async fn commit_normalized(&self, commit: &NormalizedCommit<'_>) -> IngestResult<CommitReport> {
        let mut state = self.state.lock().await;

        // All checks first so a failed commit leaves nothing behind
        let processed: HashSet<i64> = commit.processed.iter().copied().collect();
        let pending = state
            .staging
            .get(commit.staging_table)
            .map_or(0, |rows| {
                rows.iter()
                    .filter(|e| !e.processed && processed.contains(&e.row.id))
                    .count()
            });
        if pending != processed.len() {
            return Err(IngestError::IntegrityError(format!(
                "{} of {} staged rows in {} were already processed",
                processed.len() - pending,
                processed.len(),
                commit.staging_table
            )));
        }
        if !state.tables.contains_key(commit.normalized_table) {
            return Err(IngestError::NotFound(format!(
                "normalized table {}",
                commit.normalized_table
            )));
        }

        let mut report = CommitReport::default();

        if let Some(supersede) = commit.supersede {
            let ids: HashSet<i64> = supersede.record_ids.iter().copied().collect();
            if let Some(target) = state.tables.get_mut(supersede.table) {
                let before = target.records.len();
                target.records.retain(|(id, record)| {
                    let record_id = if supersede.record_id_column == "id" {
                        Some(*id)
                    } else {
                        record
                            .get(supersede.record_id_column)
                            .cloned()
                            .flatten()
                            .and_then(|v| v.parse().ok())
                    };
                    !record_id.is_some_and(|r| ids.contains(&r))
                });
                report.superseded = (before - target.records.len()) as u64;
            }
        }

        let mut inserted = Vec::with_capacity(commit.rows.len());
        for row in commit.rows {
            let mut record: Record = commit
                .metadata
                .iter()
                .map(|m| (m.name().to_string(), metadata_text(*m, row, commit.job_id)))
                .collect();
            for (spec, value) in commit.columns.iter().zip(&row.values) {
                record.insert(spec.name.clone(), value.clone());
            }
            inserted.push((state.next_id(), record));
        }
        report.inserted = inserted.len() as u64;
        if let Some(table) = state.tables.get_mut(commit.normalized_table) {
            table.records.extend(inserted);
        }

        if let Some(rows) = state.staging.get_mut(commit.staging_table) {
            for entry in rows.iter_mut().filter(|e| processed.contains(&e.row.id)) {
                entry.processed = true;
            }
        }
        report.processed = processed.len() as u64;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::normalizer::CanonicalRow;
    use crate::ingest::schema::{ColumnSpec, MetadataColumn};
    use crate::ingest::validation::NormalizedRow;
    use chrono::Utc;
    use std::time::Duration;

    fn spec(name: &str, column_type: ColumnType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            column_type,
            required: true,
        }
    }

    fn request(columns: &[ColumnSpec]) -> SchemaRequest<'_> {
        SchemaRequest {
            workbook_type: "timetable",
            table: "timetable_normalized",
            metadata: &MetadataColumn::ALL,
            columns,
            lock_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_schema_evolution_is_additive() {
        let warehouse = MemoryWarehouse::new();

        let first = vec![spec("hours", ColumnType::Integer)];
        let change = warehouse.ensure_columns(&request(&first)).await.unwrap();
        assert!(change.created);

        let second = vec![spec("hours", ColumnType::Decimal), spec("room", ColumnType::Text)];
        let change = warehouse.ensure_columns(&request(&second)).await.unwrap();
        assert!(!change.created);
        assert_eq!(change.widened, vec!["hours".to_string()]);
        assert_eq!(change.added, vec!["room".to_string()]);

        // Narrower request leaves the wider type in place
        let change = warehouse.ensure_columns(&request(&first)).await.unwrap();
        assert!(change.is_empty());
        let types = warehouse.column_types("timetable_normalized").await.unwrap();
        assert_eq!(types[0], ("hours".to_string(), ColumnType::Decimal));
    }

    #[tokio::test]
    async fn test_commit_refuses_processed_rows() {
        let warehouse = MemoryWarehouse::new();
        let fingerprint = Fingerprint::from_bytes(b"workbook");
        let columns = vec!["hours".to_string()];
        let rows = vec![CanonicalRow {
            row_number: 2,
            values: vec![Some("3".to_string())],
        }];
        let batch = StagingBatch {
            table: "t_staging",
            fingerprint: &fingerprint,
            batch_id: "b1",
            source_year: None,
            ingested_at: Utc::now(),
            columns: &columns,
            rows: &rows,
        };
        warehouse.stage_rows(&batch).await.unwrap();
        let specs = vec![spec("hours", ColumnType::Integer)];
        warehouse
            .ensure_columns(&SchemaRequest {
                workbook_type: "t",
                table: "t_normalized",
                metadata: &MetadataColumn::ALL,
                columns: &specs,
                lock_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        let staged = warehouse.staged_rows("t_staging", &fingerprint).await.unwrap();
        let ids: Vec<i64> = staged.iter().map(|r| r.id).collect();
        let commit = NormalizedCommit {
            job_id: uuid::Uuid::new_v4(),
            staging_table: "t_staging",
            normalized_table: "t_normalized",
            metadata: &MetadataColumn::ALL,
            columns: &specs,
            rows: &[],
            processed: &ids,
            supersede: None,
        };

        let report = warehouse.commit_normalized(&commit).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(warehouse.unprocessed_row_count("t_staging").await, 0);

        let again = warehouse.commit_normalized(&commit).await;
        assert!(matches!(again, Err(IngestError::IntegrityError(_))));
    }

    #[tokio::test]
    async fn test_null_keys_match_null_keys() {
        let warehouse = MemoryWarehouse::new();
        let specs = vec![spec("session_date", ColumnType::Date), spec("room", ColumnType::Text)];
        warehouse
            .ensure_columns(&SchemaRequest {
                workbook_type: "rooms",
                table: "rooms_normalized",
                metadata: &[],
                columns: &specs,
                lock_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();

        let row = |raw_id: i64, room: Option<&str>| NormalizedRow {
            raw_id,
            row_number: raw_id + 1,
            file_hash: "abc".to_string(),
            batch_id: "b1".to_string(),
            source_year: None,
            ingested_at: Utc::now(),
            values: vec![Some("2024-01-05".to_string()), room.map(str::to_string)],
        };
        let rows = vec![row(1, None), row(2, Some("R1"))];
        warehouse
            .commit_normalized(&NormalizedCommit {
                job_id: uuid::Uuid::new_v4(),
                staging_table: "rooms_staging",
                normalized_table: "rooms_normalized",
                metadata: &[],
                columns: &specs,
                rows: &rows,
                processed: &[],
                supersede: None,
            })
            .await
            .unwrap();

        let key_columns = vec!["room".to_string()];
        let keys = vec![vec![None]];
        let records = warehouse
            .existing_ranges(&RangeQuery {
                table: "rooms_normalized",
                record_id_column: "id",
                start_column: "session_date",
                end_column: None,
                key_columns: &key_columns,
                keys: &keys,
            })
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, vec![None]);
        assert_eq!(records[0].start.as_deref(), Some("2024-01-05"));
    }
}
