//! Pipeline orchestrator
//!
//! Drives one job from `Queued` to a terminal status: normalize, stage,
//! evolve the schema, validate, check overlaps, commit, export rejections and
//! record results. Handled outcomes (every row rejected, a blocked overlap)
//! come back as an `Errors` report. Anything else is recorded as an `Errors`
//! event and, for synchronous runs, returned to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::coverage::{Coverage, OverlapCoverage};
use super::export;
use super::normalizer::{NormalizedWorkbook, WorkbookNormalizer};
use super::overlap::{
    self, ConflictResolution, OverlapDetector, OverlapReport, OverlapSettings, Resolution,
};
use super::schema::{plan_columns, MetadataColumn, SchemaManager};
use super::staging::{StagingLoader, StagingMetadata, StagingOutcome};
use super::validation::{self, RuleSet, ValidationSummary};
use super::workbook::{CalamineReader, WorkbookReader};
use crate::error::{IngestError, IngestResult};
use crate::jobs::{JobStatus, JobStore, ResultCounts, ResultUpdate};
use crate::sheets::SheetConfigResolver;
use crate::warehouse::{NormalizedCommit, Supersede, Warehouse};

pub const DUPLICATE_MESSAGE: &str = "Duplicate upload detected; no new rows staged";

pub const DEFAULT_SCHEMA_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What a worker needs to run one job; serialised into the queue payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub workbook_path: PathBuf,
    pub workbook_type: String,
    pub sheet_name: String,
    #[serde(default)]
    pub source_year: Option<i32>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub conflict_resolution: Option<ConflictResolution>,
}

/// Whether a run with some rejected rows ends `Loaded` or `Errors`
///
/// Accepted rows are inserted either way. A run where every row is rejected
/// always ends `Errors`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    #[default]
    LoadAccepted,
    ErrorsOnRejection,
}

impl PartialFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PartialFailurePolicy::LoadAccepted => "load_accepted",
            PartialFailurePolicy::ErrorsOnRejection => "errors_on_rejection",
        }
    }
}

impl fmt::Display for PartialFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartialFailurePolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> IngestResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load_accepted" => Ok(PartialFailurePolicy::LoadAccepted),
            "errors_on_rejection" => Ok(PartialFailurePolicy::ErrorsOnRejection),
            other => Err(IngestError::InvalidConfig(format!(
                "Unknown partial failure policy '{other}' (expected load_accepted or errors_on_rejection)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub rejected_dir: PathBuf,
    pub artifact_dir: Option<PathBuf>,
    pub partial_failure: PartialFailurePolicy,
    pub schema_lock_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rejected_dir: PathBuf::from("uploads/rejected"),
            artifact_dir: None,
            partial_failure: PartialFailurePolicy::default(),
            schema_lock_timeout: DEFAULT_SCHEMA_LOCK_TIMEOUT,
        }
    }
}

/// Outcome of a run that reached a terminal status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub counts: ResultCounts,
    pub normalized_table: Option<String>,
    pub rejected_rows_path: Option<PathBuf>,
    pub duplicate: bool,
    pub validation: Option<ValidationSummary>,
    pub overlap: Option<OverlapReport>,
}

impl PipelineReport {
    /// `Errors` reports as the error that caused them, for callers that want
    /// a failed run to be an `Err`
    pub fn into_result(self) -> IngestResult<PipelineReport> {
        if self.status != JobStatus::Errors {
            return Ok(self);
        }
        match (self.overlap, self.validation) {
            (Some(report), _) => Err(IngestError::OverlapConflict(report)),
            (None, Some(summary)) => Err(IngestError::ValidationFailure(summary)),
            (None, None) => Err(IngestError::IntegrityError(self.message)),
        }
    }
}

pub struct PipelineOrchestrator {
    jobs: Arc<dyn JobStore>,
    warehouse: Arc<dyn Warehouse>,
    sheets: Arc<dyn SheetConfigResolver>,
    normalizer: WorkbookNormalizer,
    loader: StagingLoader,
    schema: SchemaManager,
    overlap: OverlapDetector,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        warehouse: Arc<dyn Warehouse>,
        sheets: Arc<dyn SheetConfigResolver>,
        settings: PipelineSettings,
    ) -> Self {
        Self::with_reader(jobs, warehouse, sheets, settings, Arc::new(CalamineReader))
    }

    pub fn with_reader(
        jobs: Arc<dyn JobStore>,
        warehouse: Arc<dyn Warehouse>,
        sheets: Arc<dyn SheetConfigResolver>,
        settings: PipelineSettings,
        reader: Arc<dyn WorkbookReader>,
    ) -> Self {
        Self {
            normalizer: WorkbookNormalizer::new(reader, settings.artifact_dir.clone()),
            loader: StagingLoader::new(Arc::clone(&warehouse)),
            schema: SchemaManager::new(Arc::clone(&warehouse), settings.schema_lock_timeout),
            overlap: OverlapDetector::new(Arc::clone(&warehouse)),
            jobs,
            warehouse,
            sheets,
            settings,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Synchronous mode: unhandled failures are recorded, then returned
    pub async fn run(&self, job_id: Uuid, request: &PipelineRequest) -> IngestResult<PipelineReport> {
        match self.execute(job_id, request).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.record_failure(job_id, &err).await;
                Err(err)
            },
        }
    }

    /// Queued mode: failures end the job in `Errors` and never propagate
    pub async fn run_queued(&self, job_id: Uuid, request: &PipelineRequest) -> JobStatus {
        match self.execute(job_id, request).await {
            Ok(report) => report.status,
            Err(err) => {
                self.record_failure(job_id, &err).await;
                JobStatus::Errors
            },
        }
    }

    async fn record_failure(&self, job_id: Uuid, err: &IngestError) {
        tracing::error!(job_id = %job_id, kind = err.kind(), error = %err, "Pipeline run failed");

        if let Err(store_err) = self
            .jobs
            .set_status(job_id, JobStatus::Errors, Some(&err.to_string()))
            .await
        {
            tracing::error!(
                job_id = %job_id,
                error = %store_err,
                "Failed to record pipeline failure"
            );
        }
    }

    #[tracing::instrument(
        skip(self, request),
        fields(job_id = %job_id, workbook_type = %request.workbook_type, sheet = %request.sheet_name)
    )]
    async fn execute(&self, job_id: Uuid, request: &PipelineRequest) -> IngestResult<PipelineReport> {
        self.jobs
            .set_status(job_id, JobStatus::Parsing, Some("Parsing workbook"))
            .await?;

        let config = self
            .sheets
            .resolve(&request.workbook_type, &request.sheet_name)
            .await?;
        config.validate()?;

        let workbook = self.normalizer.normalize(&request.workbook_path, &config).await?;
        let metadata = StagingMetadata::new(request.batch_id.clone(), request.source_year);
        let staging = self
            .loader
            .load(
                &config.staging_table,
                &workbook.fingerprint,
                &metadata,
                &workbook.columns,
                &workbook.rows,
            )
            .await?;
        let snapshot = self
            .loader
            .snapshot(&config.staging_table, &workbook.fingerprint)
            .await?;

        if staging.is_duplicate() {
            if snapshot.is_empty() {
                return self.finish_duplicate(job_id, &workbook, &staging).await;
            }
            tracing::info!(rows = snapshot.len(), "Resuming unprocessed rows of a duplicate upload");
        }

        let normalized_table = config.normalized_table();
        let metadata_columns = MetadataColumn::resolve(&config.metadata_columns)?;
        let specs = plan_columns(&config, &workbook.columns, &snapshot);
        let columns: Vec<String> = specs.iter().map(|spec| spec.name.clone()).collect();
        self.schema
            .ensure_table(&config.workbook_type, &normalized_table, &metadata_columns, &specs)
            .await?;

        self.jobs
            .set_status(
                job_id,
                JobStatus::Validating,
                Some(&format!("Validating {} staged rows", snapshot.len())),
            )
            .await?;

        let rules = RuleSet::new(&config, &specs)?;
        let outcome = validation::validate(&snapshot, &rules);
        let summary = outcome.summary.clone();
        let total = snapshot.len() as u64;
        let coverage = Coverage::new(workbook.fingerprint.as_str(), &staging, &specs)
            .with_artifact(workbook.artifact_path.as_deref());

        let overlap_settings = OverlapSettings::from_config(&config);
        let resolution = match &overlap_settings {
            Some(settings) if !outcome.accepted.is_empty() => {
                let report = self
                    .overlap
                    .detect(settings, &columns, &outcome.accepted)
                    .await?;
                match overlap::resolve(report, outcome.accepted, request.conflict_resolution) {
                    Ok(resolution) => resolution,
                    Err(IngestError::OverlapConflict(report)) => {
                        return self
                            .finish_blocked(job_id, report, total, summary, coverage)
                            .await;
                    },
                    Err(err) => return Err(err),
                }
            },
            _ => Resolution {
                resolution: request.conflict_resolution,
                rows: outcome.accepted,
                ..Default::default()
            },
        };

        let rejected_rows_path = if outcome.rejected.is_empty() {
            None
        } else {
            Some(export::write_rejected_rows(
                &self.settings.rejected_dir,
                job_id,
                &columns,
                &outcome.rejected,
            )?)
        };

        let processed: Vec<i64> = snapshot.iter().map(|row| row.id).collect();
        let supersede = overlap_settings
            .as_ref()
            .filter(|_| !resolution.superseded.is_empty())
            .map(|settings| Supersede {
                table: &settings.target_table,
                record_id_column: &settings.record_id_column,
                record_ids: &resolution.superseded,
            });
        let committed = self
            .warehouse
            .commit_normalized(&NormalizedCommit {
                job_id,
                staging_table: &config.staging_table,
                normalized_table: &normalized_table,
                metadata: &metadata_columns,
                columns: &specs,
                rows: &resolution.rows,
                processed: &processed,
                supersede,
            })
            .await?;

        let mut coverage = coverage.observe(&config, &specs, &resolution.rows);
        if overlap_settings.is_some() {
            coverage = coverage.with_overlap(&resolution);
        }

        let counts = ResultCounts::new(total, committed.inserted, outcome.rejected.len() as u64)?;
        self.jobs
            .record_results(
                job_id,
                &ResultUpdate {
                    counts,
                    normalized_table: Some(normalized_table.clone()),
                    coverage: coverage.to_value()?,
                    validation_summary: Some(summary.clone()),
                },
            )
            .await?;
        if let Some(path) = &rejected_rows_path {
            self.jobs
                .save_rejected_rows_path(job_id, &path.display().to_string())
                .await?;
        }

        let failed = summary.all_rejected()
            || (summary.has_rejections()
                && self.settings.partial_failure == PartialFailurePolicy::ErrorsOnRejection);
        let (status, message) = if failed {
            (JobStatus::Errors, summary.to_string())
        } else {
            let mut message = format!("Loaded {} rows into {normalized_table}", committed.inserted);
            if committed.superseded > 0 {
                message.push_str(&format!("; replaced {} existing records", committed.superseded));
            }
            if !resolution.skipped.is_empty() {
                message.push_str(&format!("; skipped {} overlapping rows", resolution.skipped.len()));
            }
            if summary.has_rejections() {
                message.push_str(&format!("; {summary}"));
            }
            (JobStatus::Loaded, message)
        };
        self.jobs.set_status(job_id, status, Some(&message)).await?;

        tracing::info!(
            status = %status,
            total,
            inserted = committed.inserted,
            rejected = counts.rejected_rows,
            "Pipeline run finished"
        );

        Ok(PipelineReport {
            job_id,
            status,
            message,
            counts,
            normalized_table: Some(normalized_table),
            rejected_rows_path,
            duplicate: staging.is_duplicate(),
            validation: Some(summary),
            overlap: None,
        })
    }

    async fn finish_duplicate(
        &self,
        job_id: Uuid,
        workbook: &NormalizedWorkbook,
        staging: &StagingOutcome,
    ) -> IngestResult<PipelineReport> {
        self.jobs
            .set_status(job_id, JobStatus::Validating, Some("No unprocessed staged rows"))
            .await?;

        let coverage = Coverage::new(workbook.fingerprint.as_str(), staging, &[])
            .with_artifact(workbook.artifact_path.as_deref());
        let counts = ResultCounts::default();
        self.jobs
            .record_results(
                job_id,
                &ResultUpdate {
                    counts,
                    normalized_table: None,
                    coverage: coverage.to_value()?,
                    validation_summary: None,
                },
            )
            .await?;
        self.jobs
            .set_status(job_id, JobStatus::Loaded, Some(DUPLICATE_MESSAGE))
            .await?;

        tracing::info!(fingerprint = %workbook.fingerprint, "Duplicate upload, nothing to load");

        Ok(PipelineReport {
            job_id,
            status: JobStatus::Loaded,
            message: DUPLICATE_MESSAGE.to_string(),
            counts,
            normalized_table: None,
            rejected_rows_path: None,
            duplicate: true,
            validation: None,
            overlap: None,
        })
    }

    /// Overlap without a policy: nothing is committed and the staged rows
    /// stay unprocessed for a resubmission
    async fn finish_blocked(
        &self,
        job_id: Uuid,
        report: OverlapReport,
        total: u64,
        summary: ValidationSummary,
        mut coverage: Coverage,
    ) -> IngestResult<PipelineReport> {
        coverage.overlap = Some(OverlapCoverage {
            resolution: None,
            replaced_records: Vec::new(),
            skipped_rows: 0,
            conflicts: report.conflicts.len(),
        });

        let counts = ResultCounts::new(total, 0, 0)?;
        self.jobs
            .record_results(
                job_id,
                &ResultUpdate {
                    counts,
                    normalized_table: None,
                    coverage: coverage.to_value()?,
                    validation_summary: Some(summary.clone()),
                },
            )
            .await?;

        let message = report.to_string();
        self.jobs
            .set_status(job_id, JobStatus::Errors, Some(&message))
            .await?;

        tracing::warn!(
            conflicts = report.conflicts.len(),
            existing = ?report.existing_record_ids(),
            "Run blocked by time range overlap"
        );

        Ok(PipelineReport {
            job_id,
            status: JobStatus::Errors,
            message,
            counts,
            normalized_table: None,
            rejected_rows_path: None,
            duplicate: false,
            validation: Some(summary),
            overlap: Some(report),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_policy_parsing() {
        assert_eq!(
            "errors_on_rejection".parse::<PartialFailurePolicy>().unwrap(),
            PartialFailurePolicy::ErrorsOnRejection
        );
        assert_eq!(
            " Load_Accepted ".parse::<PartialFailurePolicy>().unwrap(),
            PartialFailurePolicy::LoadAccepted
        );
        assert!("strict".parse::<PartialFailurePolicy>().is_err());
        assert_eq!(PartialFailurePolicy::default(), PartialFailurePolicy::LoadAccepted);
    }

    #[test]
    fn test_request_payload_defaults() {
        let request: PipelineRequest = serde_json::from_value(serde_json::json!({
            "workbook_path": "uploads/a.xlsx",
            "workbook_type": "timetable",
            "sheet_name": "Sheet1",
            "conflict_resolution": "skip"
        }))
        .unwrap();

        assert_eq!(request.conflict_resolution, Some(ConflictResolution::Skip));
        assert_eq!(request.source_year, None);
    }

    #[test]
    fn test_errors_report_into_result() {
        let report = PipelineReport {
            job_id: Uuid::new_v4(),
            status: JobStatus::Errors,
            message: "2 of 2 rows rejected".to_string(),
            counts: ResultCounts::new(2, 0, 2).unwrap(),
            normalized_table: None,
            rejected_rows_path: None,
            duplicate: false,
            validation: Some(ValidationSummary::default()),
            overlap: None,
        };
        assert!(matches!(report.into_result(), Err(IngestError::ValidationFailure(_))));
    }
}
