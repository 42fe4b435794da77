//! Shared fixtures: generated workbooks and an in-memory pipeline harness

#![allow(dead_code)]

use rust_xlsxwriter::Workbook;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use sims_upload::ingest::pipeline::{
    PartialFailurePolicy, PipelineSettings, DEFAULT_SCHEMA_LOCK_TIMEOUT,
};
use sims_upload::ingest::schema::ColumnType;
use sims_upload::ingest::{BusinessRule, CalamineReader, PipelineOrchestrator, PipelineRequest};
use sims_upload::jobs::{JobStore, MemoryJobStore, NewJob};
use sims_upload::runner::queue::DEFAULT_QUEUE_NAME;
use sims_upload::runner::{AdmissionLimits, JobRunner, MemoryJobQueue};
use sims_upload::sheets::{SheetIngestConfig, SheetOptions, StaticSheetConfigResolver};
use sims_upload::warehouse::{MemoryWarehouse, Warehouse};

pub const SHEET: &str = "Sessions";
pub const HEADERS: &[&str] = &["session_date", "teacher", "room", "hours"];

/// Timetable sheet without overlap detection
pub const TIMETABLE: &str = "timetable";
/// Same layout, with overlap detection on `session_date` per room
pub const ROOMS: &str = "rooms";

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sims_upload=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn sheet_config(workbook_type: &str, overlap: bool) -> SheetIngestConfig {
    let mut options = SheetOptions {
        column_types: BTreeMap::from([("hours".to_string(), ColumnType::Integer)]),
        non_null_columns: vec!["teacher".to_string()],
        rules: vec![BusinessRule::Range {
            column: "hours".to_string(),
            min: Some(0.0),
            max: Some(12.0),
        }],
        coverage_columns: vec!["room".to_string()],
        ..Default::default()
    };
    if overlap {
        options.time_range_column = Some("session_date".to_string());
        options.overlap_target_table = Some(format!("{workbook_type}_normalized"));
        options.overlap_key_columns = vec!["room".to_string()];
    }

    SheetIngestConfig {
        workbook_type: workbook_type.to_string(),
        sheet_name: SHEET.to_string(),
        staging_table: format!("{workbook_type}_staging"),
        normalized_table: None,
        required_columns: vec![
            "session_date".to_string(),
            "teacher".to_string(),
            "room".to_string(),
        ],
        metadata_columns: vec![],
        options,
    }
}

/// Write a one-sheet workbook; empty strings leave the cell blank
pub fn write_workbook(path: &Path, headers: &[&str], rows: &[Vec<String>]) {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET).unwrap();

    for (col, header) in headers.iter().enumerate() {
        worksheet.write_string(0, col as u16, *header).unwrap();
    }
    for (idx, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            if !value.is_empty() {
                worksheet
                    .write_string(idx as u32 + 1, col as u16, value.as_str())
                    .unwrap();
            }
        }
    }

    workbook.save(path).unwrap();
}

/// `(date, teacher, room, hours)` rows
pub fn rows(cells: &[(&str, &str, &str, &str)]) -> Vec<Vec<String>> {
    cells
        .iter()
        .map(|(date, teacher, room, hours)| {
            vec![date.to_string(), teacher.to_string(), room.to_string(), hours.to_string()]
        })
        .collect()
}

/// `count` valid rows on consecutive January days in room `room`
pub fn january(room: &str, first_day: u32, count: u32) -> Vec<Vec<String>> {
    (first_day..first_day + count)
        .map(|day| {
            vec![
                format!("2024-01-{day:02}"),
                "Ada".to_string(),
                room.to_string(),
                "2".to_string(),
            ]
        })
        .collect()
}

pub struct Harness {
    pub dir: TempDir,
    pub jobs: Arc<MemoryJobStore>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub queue: Arc<MemoryJobQueue>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl Harness {
    pub fn new(policy: PartialFailurePolicy) -> Self {
        Self::with_warehouse(policy, DEFAULT_SCHEMA_LOCK_TIMEOUT, |warehouse| {
            warehouse as Arc<dyn Warehouse>
        })
    }

    /// Harness whose orchestrator sees the memory warehouse through `wrap`
    pub fn with_warehouse(
        policy: PartialFailurePolicy,
        schema_lock_timeout: Duration,
        wrap: impl FnOnce(Arc<MemoryWarehouse>) -> Arc<dyn Warehouse>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(MemoryJobStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let sheets = Arc::new(StaticSheetConfigResolver::new([
            sheet_config(TIMETABLE, false),
            sheet_config(ROOMS, true),
        ]));
        let settings = PipelineSettings {
            rejected_dir: dir.path().join("rejected"),
            artifact_dir: Some(dir.path().join("normalized")),
            partial_failure: policy,
            schema_lock_timeout,
        };
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            jobs.clone(),
            wrap(warehouse.clone()),
            sheets,
            settings,
        ));

        Self {
            dir,
            jobs,
            warehouse,
            queue: Arc::new(MemoryJobQueue::new(DEFAULT_QUEUE_NAME)),
            orchestrator,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn workbook(&self, name: &str, rows: &[Vec<String>]) -> PathBuf {
        let path = self.path(name);
        write_workbook(&path, HEADERS, rows);
        path
    }

    pub fn runner(&self, limits: AdmissionLimits) -> JobRunner {
        JobRunner::new(
            self.jobs.clone(),
            self.queue.clone(),
            self.orchestrator.clone(),
            Arc::new(CalamineReader),
            limits,
        )
    }

    /// Create a job directly and describe how to run it
    pub async fn job(
        &self,
        workbook_type: &str,
        path: &Path,
    ) -> (uuid::Uuid, PipelineRequest) {
        let job = self
            .jobs
            .create(&NewJob {
                original_filename: path.file_name().unwrap().to_string_lossy().to_string(),
                workbook_type: workbook_type.to_string(),
                worksheet_name: Some(SHEET.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let request = PipelineRequest {
            workbook_path: path.to_path_buf(),
            workbook_type: workbook_type.to_string(),
            sheet_name: SHEET.to_string(),
            source_year: Some(2024),
            batch_id: None,
            conflict_resolution: None,
        };
        (job.job_id, request)
    }
}
