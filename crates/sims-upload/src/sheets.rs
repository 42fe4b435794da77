//! Per-sheet ingest configuration and the resolvers that look it up
//!
//! Configuration is reference data keyed by (workbook type, sheet name). The
//! pipeline resolves it once per run through an injected
//! [`SheetConfigResolver`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::error::{IngestError, IngestResult};
use crate::ingest::identifiers;
use crate::ingest::schema::ColumnType;
use crate::ingest::validation::BusinessRule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetIngestConfig {
    pub workbook_type: String,
    pub sheet_name: String,
    pub staging_table: String,
    /// Defaults to the staging table name with a `_normalized` suffix
    #[serde(default)]
    pub normalized_table: Option<String>,
    /// Required business columns, in canonical order
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    #[serde(default)]
    pub options: SheetOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetOptions {
    /// Rename the last unnamed column that holds data to `subject_column`
    pub rename_last_subject: bool,
    pub subject_column: Option<String>,
    pub column_types: BTreeMap<String, ColumnType>,
    pub non_null_columns: Vec<String>,
    pub rules: Vec<BusinessRule>,
    pub time_range_column: Option<String>,
    pub time_range_end_column: Option<String>,
    /// strftime layout of the time range cells
    pub time_range_format: Option<String>,
    pub overlap_target_table: Option<String>,
    pub overlap_key_columns: Vec<String>,
    pub overlap_record_id_column: Option<String>,
    /// Columns whose distinct values are reported in coverage metadata
    pub coverage_columns: Vec<String>,
}

pub const DEFAULT_SUBJECT_COLUMN: &str = "subject";

impl SheetIngestConfig {
    pub fn normalized_table(&self) -> String {
        match &self.normalized_table {
            Some(table) => table.clone(),
            None => {
                let base = self
                    .staging_table
                    .strip_suffix("_staging")
                    .unwrap_or(&self.staging_table);
                format!("{base}_normalized")
            },
        }
    }

    /// Reject table names that cannot be used as SQL identifiers
    pub fn validate(&self) -> IngestResult<()> {
        identifiers::validate_table_name(&self.staging_table)?;
        identifiers::validate_table_name(&self.normalized_table())?;
        if let Some(target) = &self.options.overlap_target_table {
            identifiers::validate_table_name(target)?;
        }
        if self.options.overlap_target_table.is_some() && self.options.time_range_column.is_none()
        {
            return Err(IngestError::InvalidConfig(format!(
                "{}/{}: overlap_target_table requires time_range_column",
                self.workbook_type, self.sheet_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait SheetConfigResolver: Send + Sync {
    async fn resolve(&self, workbook_type: &str, sheet_name: &str)
        -> IngestResult<SheetIngestConfig>;
}

/// Fixed set of configurations, loaded from JSON or built in code
#[derive(Debug, Clone, Default)]
pub struct StaticSheetConfigResolver {
    configs: HashMap<(String, String), SheetIngestConfig>,
}

impl StaticSheetConfigResolver {
    pub fn new(configs: impl IntoIterator<Item = SheetIngestConfig>) -> Self {
        let mut resolver = Self::default();
        for config in configs {
            resolver.insert(config);
        }
        resolver
    }

    pub fn insert(&mut self, config: SheetIngestConfig) {
        self.configs.insert(
            (config.workbook_type.clone(), config.sheet_name.clone()),
            config,
        );
    }

    /// Load a JSON array of configurations
    pub fn from_json_file(path: impl AsRef<Path>) -> IngestResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let configs: Vec<SheetIngestConfig> = serde_json::from_str(&raw)?;
        for config in &configs {
            config.validate()?;
        }
        Ok(Self::new(configs))
    }
}

#[async_trait]
impl SheetConfigResolver for StaticSheetConfigResolver {
    async fn resolve(
        &self,
        workbook_type: &str,
        sheet_name: &str,
    ) -> IngestResult<SheetIngestConfig> {
        self.configs
            .get(&(workbook_type.to_string(), sheet_name.to_string()))
            .cloned()
            .ok_or_else(|| IngestError::UnknownSheet {
                workbook_type: workbook_type.to_string(),
                sheet: sheet_name.to_string(),
            })
    }
}

#[derive(sqlx::FromRow)]
struct SheetConfigRow {
    workbook_type: String,
    sheet_name: String,
    staging_table: String,
    normalized_table: Option<String>,
    required_columns: serde_json::Value,
    metadata_columns: serde_json::Value,
    options: serde_json::Value,
}

/// Reads `sheet_ingest_config`
pub struct PgSheetConfigResolver {
    pool: Arc<PgPool>,
}

impl PgSheetConfigResolver {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SheetConfigResolver for PgSheetConfigResolver {
    async fn resolve(
        &self,
        workbook_type: &str,
        sheet_name: &str,
    ) -> IngestResult<SheetIngestConfig> {
        let row: Option<SheetConfigRow> = sqlx::query_as(
            r#"
            SELECT workbook_type, sheet_name, staging_table, normalized_table,
                   required_columns, metadata_columns, options
            FROM sheet_ingest_config
            WHERE workbook_type = $1 AND sheet_name = $2
            "#,
        )
        .bind(workbook_type)
        .bind(sheet_name)
        .fetch_optional(&*self.pool)
        .await?;

        let row = row.ok_or_else(|| IngestError::UnknownSheet {
            workbook_type: workbook_type.to_string(),
            sheet: sheet_name.to_string(),
        })?;

        let config = SheetIngestConfig {
            workbook_type: row.workbook_type,
            sheet_name: row.sheet_name,
            staging_table: row.staging_table,
            normalized_table: row.normalized_table,
            required_columns: serde_json::from_value(row.required_columns)?,
            metadata_columns: serde_json::from_value(row.metadata_columns)?,
            options: serde_json::from_value(row.options)?,
        };
        config.validate()?;

        Ok(config)
    }
}
