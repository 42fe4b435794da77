//! Row validation
//!
//! Splits a staged snapshot into accepted rows, ready for the normalized
//! table, and rejected rows carrying their reasons. Validation never touches
//! the database; whether rejections are fatal is the pipeline's decision.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::schema::ColumnSpec;
use super::staging::StagedRow;
use super::values;
use crate::error::{IngestError, IngestResult};
use crate::sheets::SheetIngestConfig;

/// Reasons quoted in a summary message before it switches to "(and N more)"
const SUMMARY_SAMPLE: usize = 3;

/// Configured business rule; blank cells are left to the non-null checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum BusinessRule {
    AllowedValues {
        column: String,
        values: Vec<String>,
    },
    Range {
        column: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        column: String,
        pattern: String,
    },
    /// `start_column` must not come after `end_column`
    Ordered {
        start_column: String,
        end_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReason {
    /// Stable key for counting, e.g. `required:teacher`
    pub code: String,
    pub message: String,
}

impl RejectionReason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub raw_id: i64,
    pub row_number: i64,
    /// Original staged values in canonical column order
    pub values: Vec<Option<String>>,
    pub reasons: Vec<RejectionReason>,
}

impl RejectedRow {
    pub fn message(&self, separator: &str) -> String {
        self.reasons
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// A staged row that passed validation, values canonicalised per column type
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub raw_id: i64,
    pub row_number: i64,
    pub file_hash: String,
    pub batch_id: String,
    pub source_year: Option<i32>,
    pub ingested_at: DateTime<Utc>,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub checked: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Failure count per reason code
    pub reasons: BTreeMap<String, u64>,
    /// First few failure messages, in row order
    pub sample_errors: Vec<String>,
    pub total_errors: u64,
}

impl ValidationSummary {
    pub fn has_rejections(&self) -> bool {
        self.rejected > 0
    }

    pub fn all_rejected(&self) -> bool {
        self.checked > 0 && self.accepted == 0
    }
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} rows rejected", self.rejected, self.checked)?;
        if !self.sample_errors.is_empty() {
            write!(f, ": {}", self.sample_errors.join("; "))?;
        }
        let more = self.total_errors.saturating_sub(self.sample_errors.len() as u64);
        if more > 0 {
            write!(f, " (and {more} more)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRow>,
    pub summary: ValidationSummary,
}

enum CompiledRule {
    AllowedValues { idx: usize, column: String, values: Vec<String> },
    Range { idx: usize, column: String, min: Option<f64>, max: Option<f64> },
    Pattern { idx: usize, column: String, pattern: Regex },
    Ordered { start: usize, end: usize, start_column: String, end_column: String },
}

/// Rules resolved against the run's column layout
pub struct RuleSet {
    columns: Vec<ColumnSpec>,
    non_null: Vec<usize>,
    time: Option<(usize, Option<String>)>,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Fails with `InvalidConfig` when a rule names an unknown column or an
    /// invalid pattern
    pub fn new(config: &SheetIngestConfig, columns: &[ColumnSpec]) -> IngestResult<Self> {
        let index = |name: &str| -> IngestResult<usize> {
            columns.iter().position(|c| c.name == name).ok_or_else(|| {
                IngestError::InvalidConfig(format!(
                    "{}/{}: rule references unknown column '{name}'",
                    config.workbook_type, config.sheet_name
                ))
            })
        };

        let non_null = config
            .options
            .non_null_columns
            .iter()
            .map(|name| index(name))
            .collect::<IngestResult<Vec<_>>>()?;

        let time = match &config.options.time_range_column {
            Some(column) => Some((index(column)?, config.options.time_range_format.clone())),
            None => None,
        };

        let rules = config
            .options
            .rules
            .iter()
            .map(|rule| {
                Ok(match rule {
                    BusinessRule::AllowedValues { column, values } => CompiledRule::AllowedValues {
                        idx: index(column)?,
                        column: column.clone(),
                        values: values.iter().map(|v| v.trim().to_string()).collect(),
                    },
                    BusinessRule::Range { column, min, max } => CompiledRule::Range {
                        idx: index(column)?,
                        column: column.clone(),
                        min: *min,
                        max: *max,
                    },
                    BusinessRule::Pattern { column, pattern } => CompiledRule::Pattern {
                        idx: index(column)?,
                        column: column.clone(),
                        pattern: Regex::new(pattern).map_err(|e| {
                            IngestError::InvalidConfig(format!("pattern for '{column}': {e}"))
                        })?,
                    },
                    BusinessRule::Ordered {
                        start_column,
                        end_column,
                    } => CompiledRule::Ordered {
                        start: index(start_column)?,
                        end: index(end_column)?,
                        start_column: start_column.clone(),
                        end_column: end_column.clone(),
                    },
                })
            })
            .collect::<IngestResult<Vec<_>>>()?;

        Ok(Self {
            columns: columns.to_vec(),
            non_null,
            time,
            rules,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    fn check(&self, raw: &[Option<String>]) -> Result<Vec<Option<String>>, Vec<RejectionReason>> {
        let mut reasons = Vec::new();
        let cell = |idx: usize| values::non_blank(raw.get(idx).and_then(|v| v.as_deref()));

        for &idx in &self.non_null {
            if cell(idx).is_none() {
                let column = &self.columns[idx].name;
                reasons.push(RejectionReason::new(
                    format!("required:{column}"),
                    format!("{column} is required"),
                ));
            }
        }

        let mut canonical = Vec::with_capacity(self.columns.len());
        for (idx, spec) in self.columns.iter().enumerate() {
            match cell(idx) {
                None => canonical.push(None),
                Some(text) => match spec.column_type.canonicalize(text) {
                    Ok(value) => canonical.push(Some(value)),
                    Err(problem) => {
                        reasons.push(RejectionReason::new(
                            format!("type:{}", spec.name),
                            format!("{}: {problem}", spec.name),
                        ));
                        canonical.push(None);
                    },
                },
            }
        }

        if let Some((idx, format)) = &self.time {
            if let Some(text) = cell(*idx) {
                if values::parse_time_value(text, format.as_deref()).is_none() {
                    let column = &self.columns[*idx].name;
                    let expected = format.as_deref().unwrap_or("an ISO date");
                    reasons.push(RejectionReason::new(
                        format!("time_format:{column}"),
                        format!("{column}: '{text}' does not match {expected}"),
                    ));
                }
            }
        }

        for rule in &self.rules {
            if let Some(reason) = apply_rule(rule, &cell) {
                reasons.push(reason);
            }
        }

        if reasons.is_empty() {
            Ok(canonical)
        } else {
            Err(reasons)
        }
    }
}

fn apply_rule<'a>(
    rule: &CompiledRule,
    cell: &impl Fn(usize) -> Option<&'a str>,
) -> Option<RejectionReason> {
    match rule {
        CompiledRule::AllowedValues { idx, column, values } => {
            let text = cell(*idx)?;
            (!values.iter().any(|v| v == text)).then(|| {
                RejectionReason::new(
                    format!("allowed_values:{column}"),
                    format!("{column}: '{text}' is not one of {}", values.join(", ")),
                )
            })
        },
        CompiledRule::Range { idx, column, min, max } => {
            let text = cell(*idx)?;
            let out_of_range = match values::parse_number(text) {
                Some(n) => min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m),
                None => true,
            };
            out_of_range.then(|| {
                let bounds = match (min, max) {
                    (Some(lo), Some(hi)) => format!("between {lo} and {hi}"),
                    (Some(lo), None) => format!("at least {lo}"),
                    (None, Some(hi)) => format!("at most {hi}"),
                    (None, None) => "numeric".to_string(),
                };
                RejectionReason::new(
                    format!("range:{column}"),
                    format!("{column}: '{text}' must be {bounds}"),
                )
            })
        },
        CompiledRule::Pattern { idx, column, pattern } => {
            let text = cell(*idx)?;
            (!pattern.is_match(text)).then(|| {
                RejectionReason::new(
                    format!("pattern:{column}"),
                    format!("{column}: '{text}' does not match {}", pattern.as_str()),
                )
            })
        },
        CompiledRule::Ordered {
            start,
            end,
            start_column,
            end_column,
        } => {
            let (a, b) = (cell(*start)?, cell(*end)?);
            let reversed = match (values::parse_timestamp(a), values::parse_timestamp(b)) {
                (Some(a), Some(b)) => a > b,
                _ => match (values::parse_number(a), values::parse_number(b)) {
                    (Some(a), Some(b)) => a > b,
                    _ => false,
                },
            };
            reversed.then(|| {
                RejectionReason::new(
                    format!("ordered:{start_column}:{end_column}"),
                    format!("{start_column} ({a}) is after {end_column} ({b})"),
                )
            })
        },
    }
}

/// Validate a staged snapshot; rows keep their snapshot order
pub fn validate(rows: &[StagedRow], rules: &RuleSet) -> ValidationOutcome {
    let names: Vec<String> = rules.columns.iter().map(|c| c.name.clone()).collect();
    let mut outcome = ValidationOutcome::default();

    for row in rows {
        let raw = row.values_for(&names);
        match rules.check(&raw) {
            Ok(values) => outcome.accepted.push(NormalizedRow {
                raw_id: row.id,
                row_number: row.row_number,
                file_hash: row.file_hash.clone(),
                batch_id: row.batch_id.clone(),
                source_year: row.source_year,
                ingested_at: row.ingested_at,
                values,
            }),
            Err(reasons) => outcome.rejected.push(RejectedRow {
                raw_id: row.id,
                row_number: row.row_number,
                values: raw,
                reasons,
            }),
        }
    }

    let summary = &mut outcome.summary;
    summary.checked = rows.len() as u64;
    summary.accepted = outcome.accepted.len() as u64;
    summary.rejected = outcome.rejected.len() as u64;
    for reason in outcome.rejected.iter().flat_map(|r| &r.reasons) {
        *summary.reasons.entry(reason.code.clone()).or_default() += 1;
        summary.total_errors += 1;
        if summary.sample_errors.len() < SUMMARY_SAMPLE {
            summary.sample_errors.push(reason.message.clone());
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::schema::ColumnType;
    use crate::sheets::SheetOptions;

    fn spec(name: &str, column_type: ColumnType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            column_type,
            required: false,
        }
    }

    fn config(options: SheetOptions) -> SheetIngestConfig {
        SheetIngestConfig {
            workbook_type: "timetable".to_string(),
            sheet_name: "Sheet1".to_string(),
            staging_table: "timetable_staging".to_string(),
            normalized_table: None,
            required_columns: vec![],
            metadata_columns: vec![],
            options,
        }
    }

    fn staged(id: i64, cells: &[(&str, &str)]) -> StagedRow {
        StagedRow {
            id,
            row_number: id + 1,
            file_hash: "abc".to_string(),
            batch_id: "b".to_string(),
            source_year: Some(2024),
            ingested_at: Utc::now(),
            values: cells
                .iter()
                .map(|(k, v)| (k.to_string(), (!v.is_empty()).then(|| v.to_string())))
                .collect(),
        }
    }

    fn columns() -> Vec<ColumnSpec> {
        vec![
            spec("date", ColumnType::Date),
            spec("teacher", ColumnType::Text),
            spec("hours", ColumnType::Decimal),
        ]
    }

    #[test]
    fn test_partitions_rows_and_counts_reasons() {
        let options = SheetOptions {
            non_null_columns: vec!["teacher".to_string()],
            ..Default::default()
        };
        let rules = RuleSet::new(&config(options), &columns()).unwrap();
        let rows = vec![
            staged(1, &[("date", "2024/01/05"), ("teacher", "Ada"), ("hours", "1,200.5")]),
            staged(2, &[("date", "2024-01-06"), ("teacher", ""), ("hours", "2")]),
            staged(3, &[("date", "someday"), ("teacher", ""), ("hours", "x")]),
        ];

        let outcome = validate(&rows, &rules);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(
            outcome.accepted[0].values,
            vec![
                Some("2024-01-05".to_string()),
                Some("Ada".to_string()),
                Some("1200.5".to_string())
            ]
        );

        let summary = &outcome.summary;
        assert_eq!((summary.checked, summary.accepted, summary.rejected), (3, 1, 2));
        assert_eq!(summary.reasons["required:teacher"], 2);
        assert_eq!(summary.reasons["type:date"], 1);
        assert_eq!(summary.reasons["type:hours"], 1);
        assert_eq!(summary.total_errors, 4);
        assert!(summary.to_string().ends_with("(and 1 more)"));

        // Rejected rows keep the original text
        assert_eq!(outcome.rejected[1].values[0].as_deref(), Some("someday"));
    }

    #[test]
    fn test_business_rules() {
        let options = SheetOptions {
            rules: vec![
                BusinessRule::AllowedValues {
                    column: "teacher".to_string(),
                    values: vec!["Ada".to_string(), "Grace".to_string()],
                },
                BusinessRule::Range {
                    column: "hours".to_string(),
                    min: Some(0.0),
                    max: Some(40.0),
                },
            ],
            ..Default::default()
        };
        let rules = RuleSet::new(&config(options), &columns()).unwrap();
        let rows = vec![
            staged(1, &[("teacher", "Grace"), ("hours", "40")]),
            staged(2, &[("teacher", "Linus"), ("hours", "41")]),
            staged(3, &[("teacher", ""), ("hours", "")]),
        ];

        let outcome = validate(&rows, &rules);

        assert_eq!(outcome.accepted.len(), 2);
        let reasons: Vec<&str> = outcome.rejected[0].reasons.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(reasons, vec!["allowed_values:teacher", "range:hours"]);
    }

    #[test]
    fn test_ordered_and_pattern_rules() {
        let columns = vec![
            spec("start", ColumnType::Date),
            spec("end", ColumnType::Date),
            spec("code", ColumnType::Text),
        ];
        let options = SheetOptions {
            rules: vec![
                BusinessRule::Ordered {
                    start_column: "start".to_string(),
                    end_column: "end".to_string(),
                },
                BusinessRule::Pattern {
                    column: "code".to_string(),
                    pattern: r"^[A-Z]{3}\d{3}$".to_string(),
                },
            ],
            ..Default::default()
        };
        let rules = RuleSet::new(&config(options), &columns).unwrap();
        let rows = vec![
            staged(1, &[("start", "2024-01-01"), ("end", "2024-01-31"), ("code", "MAT101")]),
            staged(2, &[("start", "2024-02-01"), ("end", "2024-01-31"), ("code", "mat")]),
        ];

        let outcome = validate(&rows, &rules);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected[0].reasons.len(), 2);
        assert_eq!(outcome.rejected[0].reasons[0].code, "ordered:start:end");
    }

    #[test]
    fn test_time_range_format_check() {
        let columns = vec![spec("week", ColumnType::Text)];
        let options = SheetOptions {
            time_range_column: Some("week".to_string()),
            time_range_format: Some("%d/%m/%Y".to_string()),
            ..Default::default()
        };
        let rules = RuleSet::new(&config(options), &columns).unwrap();
        let rows = vec![
            staged(1, &[("week", "05/01/2024")]),
            staged(2, &[("week", "week one")]),
        ];

        let outcome = validate(&rows, &rules);

        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.rejected[0].reasons[0].code, "time_format:week");
    }

    #[test]
    fn test_unknown_rule_column_is_config_error() {
        let options = SheetOptions {
            non_null_columns: vec!["room".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            RuleSet::new(&config(options), &columns()),
            Err(IngestError::InvalidConfig(_))
        ));

        let bad_pattern = SheetOptions {
            rules: vec![BusinessRule::Pattern {
                column: "teacher".to_string(),
                pattern: "(".to_string(),
            }],
            ..Default::default()
        };
        assert!(RuleSet::new(&config(bad_pattern), &columns()).is_err());
    }

    #[test]
    fn test_summary_message_without_overflow() {
        let summary = ValidationSummary {
            checked: 10,
            accepted: 9,
            rejected: 1,
            reasons: BTreeMap::from([("required:teacher".to_string(), 1)]),
            sample_errors: vec!["teacher is required".to_string()],
            total_errors: 1,
        };
        assert_eq!(summary.to_string(), "1 of 10 rows rejected: teacher is required");
        assert!(!summary.all_rejected());
    }
}
