//! Coverage metadata stored with each job result

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::overlap::{ConflictResolution, Resolution, TimeRange};
use super::schema::{ColumnSpec, ColumnType};
use super::staging::StagingOutcome;
use super::validation::NormalizedRow;
use super::values;
use crate::error::IngestResult;
use crate::sheets::SheetIngestConfig;

/// Distinct values kept per category column
pub const MAX_CATEGORY_VALUES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeCoverage {
    pub column: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagingCoverage {
    pub fingerprint: String,
    pub batch_id: Option<String>,
    pub duplicate: bool,
    pub staged_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlapCoverage {
    pub resolution: Option<ConflictResolution>,
    pub replaced_records: Vec<i64>,
    pub skipped_rows: u64,
    pub conflicts: usize,
}

impl From<&Resolution> for OverlapCoverage {
    fn from(resolution: &Resolution) -> Self {
        Self {
            resolution: resolution.resolution,
            replaced_records: resolution.superseded.clone(),
            skipped_rows: resolution.skipped.len() as u64,
            conflicts: resolution.conflicts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coverage {
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeCoverage>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub categories: BTreeMap<String, Vec<String>>,
    pub staging: StagingCoverage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlap: Option<OverlapCoverage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl Coverage {
    pub fn new(fingerprint: &str, staging: &StagingOutcome, columns: &[ColumnSpec]) -> Self {
        let batch_id = match staging {
            StagingOutcome::Staged { batch_id, .. } => Some(batch_id.clone()),
            StagingOutcome::Duplicate { .. } => None,
        };

        Self {
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            time_range: None,
            categories: BTreeMap::new(),
            staging: StagingCoverage {
                fingerprint: fingerprint.to_string(),
                batch_id,
                duplicate: staging.is_duplicate(),
                staged_rows: staging.staged_rows(),
            },
            overlap: None,
            artifact: None,
        }
    }

    /// Observed time range and category values over the committed rows
    ///
    /// The time column is `time_range_column` when configured, otherwise the
    /// first date or timestamp column.
    pub fn observe(
        mut self,
        config: &SheetIngestConfig,
        columns: &[ColumnSpec],
        rows: &[NormalizedRow],
    ) -> Self {
        let time_column = config.options.time_range_column.clone().or_else(|| {
            columns
                .iter()
                .find(|c| matches!(c.column_type, ColumnType::Date | ColumnType::Timestamp))
                .map(|c| c.name.clone())
        });

        if let Some(column) = time_column {
            if let Some(idx) = columns.iter().position(|c| c.name == column) {
                let format = config.options.time_range_format.as_deref();
                self.time_range = rows
                    .iter()
                    .filter_map(|row| {
                        let text = row.values.get(idx)?.as_deref()?;
                        values::parse_time_value(text, format)
                    })
                    .map(|ts| TimeRange::new(ts, ts))
                    .reduce(TimeRange::merge)
                    .map(|range| TimeCoverage {
                        column,
                        start: range.start,
                        end: range.end,
                    });
            }
        }

        for column in &config.options.coverage_columns {
            let Some(idx) = columns.iter().position(|c| &c.name == column) else {
                continue;
            };
            let distinct: BTreeSet<&str> = rows
                .iter()
                .filter_map(|row| row.values.get(idx)?.as_deref())
                .collect();
            self.categories.insert(
                column.clone(),
                distinct
                    .into_iter()
                    .take(MAX_CATEGORY_VALUES)
                    .map(str::to_string)
                    .collect(),
            );
        }

        self
    }

    pub fn with_overlap(mut self, resolution: &Resolution) -> Self {
        self.overlap = Some(OverlapCoverage::from(resolution));
        self
    }

    pub fn with_artifact(mut self, artifact: Option<&Path>) -> Self {
        self.artifact = artifact.map(|p| p.display().to_string());
        self
    }

    pub fn to_value(&self) -> IngestResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
