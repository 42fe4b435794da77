//! Schema manager: column typing and additive evolution of normalized tables
//!
//! Column types come from configuration when declared and are otherwise
//! inferred from the staged snapshot. Existing tables only ever gain columns
//! or have a column widened; nothing is dropped or narrowed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::staging::StagedRow;
use super::values;
use crate::error::{IngestError, IngestResult};
use crate::sheets::SheetIngestConfig;
use crate::warehouse::{SchemaRequest, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Date,
    Timestamp,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "BIGINT",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Map an `information_schema.columns.data_type` back to a column type
    pub fn from_sql_type(data_type: &str) -> ColumnType {
        match data_type.to_ascii_lowercase().as_str() {
            "bigint" | "integer" | "smallint" => ColumnType::Integer,
            "numeric" | "double precision" | "real" => ColumnType::Decimal,
            "date" => ColumnType::Date,
            t if t.starts_with("timestamp") => ColumnType::Timestamp,
            _ => ColumnType::Text,
        }
    }

    /// Smallest type that holds values of both `self` and `other`
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Decimal) | (Decimal, Integer) => Decimal,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => Text,
        }
    }

    /// Narrowest type that fits a single non-blank value
    ///
    /// Zero-padded or `+`-prefixed numbers stay `Text`.
    pub fn classify(value: &str) -> ColumnType {
        if values::is_padded_number(value) {
            ColumnType::Text
        } else if values::parse_integer(value).is_some() {
            ColumnType::Integer
        } else if values::parse_decimal(value).is_some() {
            ColumnType::Decimal
        } else if values::parse_date(value).is_some() {
            ColumnType::Date
        } else if values::parse_timestamp(value).is_some() {
            ColumnType::Timestamp
        } else {
            ColumnType::Text
        }
    }

    /// Canonical text for a cell of this type; `Err` when it does not fit
    pub fn canonicalize(self, value: &str) -> Result<String, String> {
        let text = value.trim();
        match self {
            ColumnType::Text => Ok(text.to_string()),
            ColumnType::Integer => values::parse_integer(text)
                .map(|v| v.to_string())
                .ok_or_else(|| format!("'{text}' is not an integer")),
            ColumnType::Decimal => {
                values::parse_decimal(text).ok_or_else(|| format!("'{text}' is not a number"))
            },
            ColumnType::Date => values::parse_date(text)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok_or_else(|| format!("'{text}' is not a date")),
            ColumnType::Timestamp => values::parse_timestamp(text)
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .ok_or_else(|| format!("'{text}' is not a timestamp")),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = IngestError;

    /// Accepts the short names plus SQL spellings such as `DECIMAL(6,2)`
    fn from_str(s: &str) -> IngestResult<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let base = lowered.split('(').next().unwrap_or_default().trim();

        match base {
            "text" | "varchar" | "char" | "character varying" | "string" => Ok(ColumnType::Text),
            "integer" | "int" | "bigint" | "smallint" => Ok(ColumnType::Integer),
            "decimal" | "numeric" | "number" | "float" | "double" => Ok(ColumnType::Decimal),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            _ => Err(IngestError::InvalidConfig(format!("Unknown column type '{s}'"))),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = IngestError;

    fn try_from(value: String) -> IngestResult<Self> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.as_str().to_string()
    }
}

/// One business column of a normalized table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub required: bool,
}

/// Ingestion metadata carried by every normalized row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataColumn {
    RawId,
    JobId,
    FileHash,
    BatchId,
    SourceYear,
    IngestedAt,
}

impl MetadataColumn {
    pub const ALL: [MetadataColumn; 6] = [
        MetadataColumn::RawId,
        MetadataColumn::JobId,
        MetadataColumn::FileHash,
        MetadataColumn::BatchId,
        MetadataColumn::SourceYear,
        MetadataColumn::IngestedAt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetadataColumn::RawId => "raw_id",
            MetadataColumn::JobId => "job_id",
            MetadataColumn::FileHash => "file_hash",
            MetadataColumn::BatchId => "batch_id",
            MetadataColumn::SourceYear => "source_year",
            MetadataColumn::IngestedAt => "ingested_at",
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            MetadataColumn::RawId => "BIGINT",
            MetadataColumn::JobId => "UUID",
            MetadataColumn::FileHash | MetadataColumn::BatchId => "TEXT",
            MetadataColumn::SourceYear => "INTEGER",
            MetadataColumn::IngestedAt => "TIMESTAMPTZ",
        }
    }

    /// Configured metadata names, or every column when none are configured
    pub fn resolve(names: &[String]) -> IngestResult<Vec<MetadataColumn>> {
        if names.is_empty() {
            return Ok(Self::ALL.to_vec());
        }

        names
            .iter()
            .map(|name| {
                Self::ALL
                    .into_iter()
                    .find(|column| column.name() == name.trim())
                    .ok_or_else(|| {
                        IngestError::InvalidConfig(format!("Unknown metadata column '{name}'"))
                    })
            })
            .collect()
    }
}

/// Column names the normalized table keeps for itself
pub const RESERVED_COLUMNS: &[&str] = &["id", "processed_at"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub created: bool,
    pub added: Vec<String>,
    pub widened: Vec<String>,
}

impl SchemaChange {
    pub fn is_empty(&self) -> bool {
        !self.created && self.added.is_empty() && self.widened.is_empty()
    }
}

/// Column specs for a run, in canonical column order
///
/// Declared `column_types` win; otherwise the type is inferred from the
/// snapshot values. A column with no non-blank value is `Text`. Headers that
/// collide with reserved or metadata column names stay in staging only.
pub fn plan_columns(
    config: &SheetIngestConfig,
    columns: &[String],
    rows: &[StagedRow],
) -> Vec<ColumnSpec> {
    let declared: BTreeMap<String, ColumnType> = config
        .options
        .column_types
        .iter()
        .map(|(name, ty)| (name.trim().to_string(), *ty))
        .collect();

    columns
        .iter()
        .filter(|name| {
            let reserved = is_reserved_column(name);
            if reserved {
                tracing::warn!(
                    column = %name,
                    sheet = %config.sheet_name,
                    "Skipping source column that shares a reserved column name"
                );
            }
            !reserved
        })
        .map(|name| {
            let column_type = declared.get(name).copied().unwrap_or_else(|| {
                infer_type(rows.iter().filter_map(|row| row.value(name)))
            });

            ColumnSpec {
                name: name.clone(),
                column_type,
                required: config.required_columns.iter().any(|r| r == name),
            }
        })
        .collect()
}

pub fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name) || MetadataColumn::ALL.iter().any(|m| m.name() == name)
}

pub fn infer_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    values
        .filter(|v| !values::is_blank(v))
        .map(ColumnType::classify)
        .reduce(ColumnType::widen)
        .unwrap_or(ColumnType::Text)
}

/// Ensures normalized tables exist with the planned columns
pub struct SchemaManager {
    warehouse: Arc<dyn Warehouse>,
    lock_timeout: Duration,
}

impl SchemaManager {
    pub fn new(warehouse: Arc<dyn Warehouse>, lock_timeout: Duration) -> Self {
        Self {
            warehouse,
            lock_timeout,
        }
    }

    /// Create or extend `table`; DDL is serialised per (workbook type, table)
    #[tracing::instrument(skip(self, metadata, columns), fields(columns = columns.len()))]
    pub async fn ensure_table(
        &self,
        workbook_type: &str,
        table: &str,
        metadata: &[MetadataColumn],
        columns: &[ColumnSpec],
    ) -> IngestResult<SchemaChange> {
        let request = SchemaRequest {
            workbook_type,
            table,
            metadata,
            columns,
            lock_timeout: self.lock_timeout,
        };

        let change = tokio::time::timeout(self.lock_timeout, self.warehouse.ensure_columns(&request))
            .await
            .map_err(|_| IngestError::LockTimeout {
                table: table.to_string(),
            })??;

        if !change.is_empty() {
            tracing::info!(
                table,
                created = change.created,
                added = ?change.added,
                widened = ?change.widened,
                "Normalized table schema updated"
            );
        }

        Ok(change)
    }
}
