//! Time-range overlap detection against already committed records
//!
//! Active only when a sheet configures both `time_range_column` and
//! `overlap_target_table`. Ranges are inclusive on both ends. A detected
//! overlap blocks the run unless the caller chose a [`ConflictResolution`].

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::validation::NormalizedRow;
use super::values;
use crate::error::{IngestError, IngestResult};
use crate::sheets::SheetIngestConfig;
use crate::warehouse::{ExistingRecord, RangeQuery, Warehouse};

pub const DEFAULT_RECORD_ID_COLUMN: &str = "id";

/// Conflicting entries listed in a report message before it is cut short
const MESSAGE_SAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Insert anyway; existing records are left alone
    Append,
    /// Delete the conflicting existing records, then insert
    Replace,
    /// Leave conflicting rows out of this run
    Skip,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Append => "append",
            ConflictResolution::Replace => "replace",
            ConflictResolution::Skip => "skip",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(ConflictResolution::Append),
            "replace" => Ok(ConflictResolution::Replace),
            "skip" => Ok(ConflictResolution::Skip),
            other => Err(IngestError::InvalidConfig(format!(
                "Unknown conflict resolution '{other}' (expected append, replace or skip)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    /// Ordered so that `start <= end` whatever order the cells held
    pub fn new(a: NaiveDateTime, b: NaiveDateTime) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn merge(self, other: TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

/// Overlap options pulled out of a sheet configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapSettings {
    pub target_table: String,
    pub time_column: String,
    pub end_column: Option<String>,
    pub format: Option<String>,
    pub key_columns: Vec<String>,
    pub record_id_column: String,
}

impl OverlapSettings {
    /// `None` when detection is not configured for the sheet
    pub fn from_config(config: &SheetIngestConfig) -> Option<Self> {
        let options = &config.options;
        let time_column = options.time_range_column.clone()?;
        let target_table = options.overlap_target_table.clone()?;

        Some(Self {
            target_table,
            time_column,
            end_column: options.time_range_end_column.clone(),
            format: options.time_range_format.clone(),
            key_columns: options.overlap_key_columns.clone(),
            record_id_column: options
                .overlap_record_id_column
                .clone()
                .unwrap_or_else(|| DEFAULT_RECORD_ID_COLUMN.to_string()),
        })
    }

    fn parse(&self, text: Option<&str>) -> Option<NaiveDateTime> {
        values::parse_time_value(text?, self.format.as_deref())
    }

    fn range(&self, start: Option<&str>, end: Option<&str>) -> Option<TimeRange> {
        let start = self.parse(start)?;
        let end = match &self.end_column {
            Some(_) => self.parse(end).unwrap_or(start),
            None => start,
        };
        Some(TimeRange::new(start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapConflict {
    /// Staging id of the incoming row
    pub raw_id: i64,
    pub row_number: i64,
    pub key: Vec<Option<String>>,
    pub requested: TimeRange,
    pub existing: TimeRange,
    pub existing_record_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapReport {
    pub target_table: String,
    pub time_range_column: String,
    pub conflicts: Vec<OverlapConflict>,
}

impl OverlapReport {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Distinct existing record ids, ascending
    pub fn existing_record_ids(&self) -> Vec<i64> {
        self.conflicts
            .iter()
            .map(|c| c.existing_record_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn conflicting_raw_ids(&self) -> HashSet<i64> {
        self.conflicts.iter().map(|c| c.raw_id).collect()
    }
}

impl fmt::Display for OverlapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time range overlap in {}.{}: ",
            self.target_table, self.time_range_column
        )?;
        let entries: Vec<String> = self
            .conflicts
            .iter()
            .take(MESSAGE_SAMPLE)
            .map(|c| {
                format!(
                    "row {} requested {} overlaps existing record {} ({})",
                    c.row_number, c.requested, c.existing_record_id, c.existing
                )
            })
            .collect();
        f.write_str(&entries.join("; "))?;
        if self.conflicts.len() > MESSAGE_SAMPLE {
            write!(f, " (and {} more)", self.conflicts.len() - MESSAGE_SAMPLE)?;
        }
        let ids: Vec<String> = self.existing_record_ids().iter().map(i64::to_string).collect();
        write!(
            f,
            "; existing record id(s) {}; resubmit with conflict_resolution append, replace or skip",
            ids.join(", ")
        )
    }
}

/// Rows to insert after a conflict policy was applied
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub resolution: Option<ConflictResolution>,
    pub rows: Vec<NormalizedRow>,
    /// Existing record ids to delete before the insert
    pub superseded: Vec<i64>,
    /// Staging ids of incoming rows left out
    pub skipped: Vec<i64>,
    pub conflicts: usize,
}

fn position(columns: &[String], name: &str) -> IngestResult<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| IngestError::InvalidConfig(format!("overlap column '{name}' is not in the sheet")))
}

fn key_of(row: &NormalizedRow, key_idx: &[usize]) -> Vec<Option<String>> {
    key_idx
        .iter()
        .map(|&i| row.values.get(i).cloned().flatten())
        .collect()
}

fn same_key(a: &[Option<String>], b: &[Option<String>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.as_deref().map(str::trim) == y.as_deref().map(str::trim)
        })
}

/// Pairs of incoming rows and existing records whose ranges intersect
pub fn find_conflicts(
    settings: &OverlapSettings,
    columns: &[String],
    rows: &[NormalizedRow],
    existing: &[ExistingRecord],
) -> IngestResult<Vec<OverlapConflict>> {
    let time_idx = position(columns, &settings.time_column)?;
    let end_idx = settings
        .end_column
        .as_deref()
        .map(|c| position(columns, c))
        .transpose()?;
    let key_idx = settings
        .key_columns
        .iter()
        .map(|c| position(columns, c))
        .collect::<IngestResult<Vec<_>>>()?;

    let existing: Vec<(&ExistingRecord, TimeRange)> = existing
        .iter()
        .filter_map(|record| {
            settings
                .range(record.start.as_deref(), record.end.as_deref())
                .map(|range| (record, range))
        })
        .collect();

    let mut conflicts = Vec::new();
    for row in rows {
        let cell = |idx: usize| row.values.get(idx).and_then(|v| v.as_deref());
        let Some(requested) = settings.range(cell(time_idx), end_idx.and_then(cell)) else {
            continue;
        };
        let key = key_of(row, &key_idx);

        for (record, range) in &existing {
            if same_key(&key, &record.key) && requested.overlaps(range) {
                conflicts.push(OverlapConflict {
                    raw_id: row.raw_id,
                    row_number: row.row_number,
                    key: key.clone(),
                    requested,
                    existing: *range,
                    existing_record_id: record.record_id,
                });
            }
        }
    }

    Ok(conflicts)
}

/// Apply the caller's policy; without one a non-empty report blocks the run
pub fn resolve(
    report: OverlapReport,
    rows: Vec<NormalizedRow>,
    policy: Option<ConflictResolution>,
) -> IngestResult<Resolution> {
    if report.is_empty() {
        return Ok(Resolution {
            resolution: policy,
            rows,
            ..Default::default()
        });
    }

    let conflicts = report.conflicts.len();
    match policy {
        None => Err(IngestError::OverlapConflict(report)),
        Some(ConflictResolution::Append) => Ok(Resolution {
            resolution: policy,
            rows,
            superseded: Vec::new(),
            skipped: Vec::new(),
            conflicts,
        }),
        Some(ConflictResolution::Replace) => Ok(Resolution {
            resolution: policy,
            rows,
            superseded: report.existing_record_ids(),
            skipped: Vec::new(),
            conflicts,
        }),
        Some(ConflictResolution::Skip) => {
            let conflicting = report.conflicting_raw_ids();
            let (skipped, kept): (Vec<_>, Vec<_>) =
                rows.into_iter().partition(|r| conflicting.contains(&r.raw_id));
            Ok(Resolution {
                resolution: policy,
                rows: kept,
                superseded: Vec::new(),
                skipped: skipped.iter().map(|r| r.raw_id).collect(),
                conflicts,
            })
        },
    }
}

pub struct OverlapDetector {
    warehouse: Arc<dyn Warehouse>,
}

impl OverlapDetector {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Compare accepted rows with the records already in the target table
    #[tracing::instrument(skip(self, settings, columns, rows), fields(table = %settings.target_table, rows = rows.len()))]
    pub async fn detect(
        &self,
        settings: &OverlapSettings,
        columns: &[String],
        rows: &[NormalizedRow],
    ) -> IngestResult<OverlapReport> {
        let key_idx = settings
            .key_columns
            .iter()
            .map(|c| position(columns, c))
            .collect::<IngestResult<Vec<_>>>()?;
        let keys: Vec<Vec<Option<String>>> = rows
            .iter()
            .map(|row| key_of(row, &key_idx))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing = if rows.is_empty() {
            Vec::new()
        } else {
            let query = RangeQuery {
                table: &settings.target_table,
                record_id_column: &settings.record_id_column,
                start_column: &settings.time_column,
                end_column: settings.end_column.as_deref(),
                key_columns: &settings.key_columns,
                keys: &keys,
            };
            self.warehouse.existing_ranges(&query).await?
        };

        let conflicts = find_conflicts(settings, columns, rows, &existing)?;
        if !conflicts.is_empty() {
            tracing::warn!(conflicts = conflicts.len(), "Time range overlap detected");
        }

        Ok(OverlapReport {
            target_table: settings.target_table.clone(),
            time_range_column: settings.time_column.clone(),
            conflicts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn settings() -> OverlapSettings {
        OverlapSettings {
            target_table: "timetable_normalized".to_string(),
            time_column: "date".to_string(),
            end_column: None,
            format: None,
            key_columns: vec!["teacher".to_string()],
            record_id_column: DEFAULT_RECORD_ID_COLUMN.to_string(),
        }
    }

    fn columns() -> Vec<String> {
        vec!["date".to_string(), "teacher".to_string()]
    }

    fn row(raw_id: i64, date: &str, teacher: &str) -> NormalizedRow {
        NormalizedRow {
            raw_id,
            row_number: raw_id + 1,
            file_hash: "abc".to_string(),
            batch_id: "b".to_string(),
            source_year: None,
            ingested_at: Utc::now(),
            values: vec![Some(date.to_string()), Some(teacher.to_string())],
        }
    }

    fn record(id: i64, date: &str, teacher: &str) -> ExistingRecord {
        ExistingRecord {
            record_id: id,
            key: vec![Some(teacher.to_string())],
            start: Some(date.to_string()),
            end: None,
        }
    }

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_ranges_are_inclusive() {
        let a = TimeRange::new(day(1), day(5));
        assert!(a.overlaps(&TimeRange::new(day(5), day(9))));
        assert!(!a.overlaps(&TimeRange::new(day(6), day(9))));
        assert_eq!(TimeRange::new(day(9), day(2)).start, day(2));
    }

    #[test]
    fn test_conflicts_match_on_key_and_range() {
        let rows = vec![row(1, "2024-01-05", "Ada"), row(2, "2024-01-05", "Grace")];
        let existing = vec![
            record(70, "2024-01-05 00:00:00", "Ada"),
            record(71, "2024-01-06", "Grace"),
        ];

        let conflicts = find_conflicts(&settings(), &columns(), &rows, &existing).unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].raw_id, 1);
        assert_eq!(conflicts[0].existing_record_id, 70);
    }

    #[test]
    fn test_end_column_and_blank_values() {
        let mut settings = settings();
        settings.key_columns.clear();
        settings.end_column = Some("until".to_string());
        let columns = vec!["date".to_string(), "until".to_string()];

        let mut spanning = row(1, "2024-01-01", "");
        spanning.values[1] = Some("2024-01-10".to_string());
        let mut blank = row(2, "nan", "");
        blank.values[1] = None;

        let existing = vec![ExistingRecord {
            record_id: 9,
            key: vec![],
            start: Some("2024-01-08".to_string()),
            end: Some("2024-01-20".to_string()),
        }];

        let conflicts =
            find_conflicts(&settings, &columns, &[spanning, blank], &existing).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].requested, TimeRange::new(day(1), day(10)));
    }

    fn report() -> OverlapReport {
        let rows = vec![row(1, "2024-01-05", "Ada")];
        OverlapReport {
            target_table: "timetable_normalized".to_string(),
            time_range_column: "date".to_string(),
            conflicts: find_conflicts(
                &settings(),
                &columns(),
                &rows,
                &[record(70, "2024-01-05", "Ada")],
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_policies() {
        let rows = || vec![row(1, "2024-01-05", "Ada"), row(2, "2024-01-06", "Ada")];

        let blocked = resolve(report(), rows(), None).unwrap_err();
        match blocked {
            IngestError::OverlapConflict(report) => {
                let message = report.to_string();
                assert!(message.contains("timetable_normalized.date"));
                assert!(message.contains("existing record id(s) 70"));
            },
            other => panic!("unexpected error: {other}"),
        }

        let append = resolve(report(), rows(), Some(ConflictResolution::Append)).unwrap();
        assert_eq!(append.rows.len(), 2);
        assert!(append.superseded.is_empty());

        let replace = resolve(report(), rows(), Some(ConflictResolution::Replace)).unwrap();
        assert_eq!(replace.rows.len(), 2);
        assert_eq!(replace.superseded, vec![70]);

        let skip = resolve(report(), rows(), Some(ConflictResolution::Skip)).unwrap();
        assert_eq!(skip.rows.len(), 1);
        assert_eq!(skip.skipped, vec![1]);
        assert_eq!(skip.conflicts, 1);
    }

    #[test]
    fn test_no_conflicts_needs_no_policy() {
        let empty = OverlapReport {
            target_table: "t".to_string(),
            time_range_column: "date".to_string(),
            conflicts: vec![],
        };
        let resolved = resolve(empty, vec![row(1, "2024-01-05", "Ada")], None).unwrap();
        assert_eq!(resolved.rows.len(), 1);
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!("SKIP".parse::<ConflictResolution>().unwrap(), ConflictResolution::Skip);
        assert!("merge".parse::<ConflictResolution>().is_err());
        assert_eq!(
            serde_json::to_string(&ConflictResolution::Replace).unwrap(),
            "\"replace\""
        );
    }

    #[test]
    fn test_settings_require_target_and_column() {
        let mut config = crate::sheets::SheetIngestConfig {
            workbook_type: "timetable".to_string(),
            sheet_name: "Sheet1".to_string(),
            staging_table: "timetable_staging".to_string(),
            normalized_table: None,
            required_columns: vec![],
            metadata_columns: vec![],
            options: Default::default(),
        };
        config.options.time_range_column = Some("date".to_string());
        assert!(OverlapSettings::from_config(&config).is_none());

        config.options.overlap_target_table = Some("timetable_normalized".to_string());
        let settings = OverlapSettings::from_config(&config).unwrap();
        assert_eq!(settings.record_id_column, "id");
    }
}
