//! Workbook normalizer
//!
//! Turns one worksheet into canonical rows: cleaned headers, required columns
//! first in configured order, extra columns after them in sheet order. The
//! workbook's fingerprint is the SHA-256 of its raw bytes.

use regex::Regex;
use sims_common::fingerprint::Fingerprint;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::export;
use super::identifiers::{self, IdentifierSet};
use super::values;
use super::workbook::{RawSheet, WorkbookReader};
use crate::error::{IngestError, IngestResult};
use crate::sheets::{SheetIngestConfig, SheetOptions, DEFAULT_SUBJECT_COLUMN};

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRow {
    pub row_number: usize,
    /// Aligned with [`NormalizedWorkbook::columns`]
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NormalizedWorkbook {
    pub sheet_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<CanonicalRow>,
    pub fingerprint: Fingerprint,
    pub file_size: u64,
    /// Canonical rows written as CSV, when an artifact directory is configured
    pub artifact_path: Option<PathBuf>,
}

pub struct WorkbookNormalizer {
    reader: Arc<dyn WorkbookReader>,
    artifact_dir: Option<PathBuf>,
}

impl WorkbookNormalizer {
    pub fn new(reader: Arc<dyn WorkbookReader>, artifact_dir: Option<PathBuf>) -> Self {
        Self {
            reader,
            artifact_dir,
        }
    }

    /// Read, clean and reorder one sheet; runs on the blocking pool
    #[tracing::instrument(skip(self, config), fields(sheet = %config.sheet_name))]
    pub async fn normalize(
        &self,
        path: &Path,
        config: &SheetIngestConfig,
    ) -> IngestResult<NormalizedWorkbook> {
        let reader = Arc::clone(&self.reader);
        let artifact_dir = self.artifact_dir.clone();
        let path = path.to_path_buf();
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            normalize_blocking(reader.as_ref(), &path, &config, artifact_dir.as_deref())
        })
        .await
        .map_err(|e| IngestError::Workbook(format!("Workbook parsing task failed: {e}")))?
    }
}

fn normalize_blocking(
    reader: &dyn WorkbookReader,
    path: &Path,
    config: &SheetIngestConfig,
    artifact_dir: Option<&Path>,
) -> IngestResult<NormalizedWorkbook> {
    let bytes = std::fs::read(path)?;
    let fingerprint = Fingerprint::from_bytes(&bytes);
    let file_size = bytes.len() as u64;
    drop(bytes);

    let raw = reader.read_sheet(path, &config.sheet_name)?;
    let (columns, rows) = canonicalize(raw, config)?;

    let artifact_path = match artifact_dir {
        Some(dir) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workbook".to_string());
            let target = dir.join(format!("{stem}.{}.csv", fingerprint.short()));
            export::write_canonical_rows(&target, &columns, &rows)?;
            Some(target)
        },
        None => None,
    };

    tracing::debug!(
        rows = rows.len(),
        columns = columns.len(),
        fingerprint = %fingerprint,
        "Workbook normalized"
    );

    Ok(NormalizedWorkbook {
        sheet_name: config.sheet_name.clone(),
        columns,
        rows,
        fingerprint,
        file_size,
        artifact_path,
    })
}

/// Clean headers, check required columns and reorder
///
/// Pure with respect to I/O; the unit of the normalizer's contract.
pub fn canonicalize(
    raw: RawSheet,
    config: &SheetIngestConfig,
) -> IngestResult<(Vec<String>, Vec<CanonicalRow>)> {
    let headers = clean_headers(&raw, &config.options)?;

    let missing: Vec<String> = config
        .required_columns
        .iter()
        .filter(|required| !headers.iter().any(|h| h.as_deref() == Some(required.as_str())))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingColumns {
            sheet: raw.sheet_name,
            missing,
        });
    }

    // (canonical name, source index)
    let mut layout: Vec<(String, usize)> = config
        .required_columns
        .iter()
        .filter_map(|required| {
            headers
                .iter()
                .position(|h| h.as_deref() == Some(required.as_str()))
                .map(|idx| (required.clone(), idx))
        })
        .collect();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(name) = header {
            if !config.required_columns.contains(name) {
                layout.push((name.clone(), idx));
            }
        }
    }

    let rows = raw
        .rows
        .iter()
        .filter_map(|row| {
            let values: Vec<Option<String>> = layout
                .iter()
                .map(|(_, idx)| values::non_blank(row.cell(*idx)).map(str::to_string))
                .collect();
            values.iter().any(Option::is_some).then(|| CanonicalRow {
                row_number: row.row_number,
                values,
            })
        })
        .collect();

    let columns = layout.into_iter().map(|(name, _)| name).collect();
    Ok((columns, rows))
}

/// Cleaned header per source column; `None` marks a dropped column
fn clean_headers(raw: &RawSheet, options: &SheetOptions) -> IngestResult<Vec<Option<String>>> {
    let unnamed = Regex::new(r"^Unnamed: \d+$")
        .map_err(|e| IngestError::InvalidConfig(e.to_string()))?;

    let width = raw
        .rows
        .iter()
        .map(|row| row.cells.len())
        .chain(std::iter::once(raw.headers.len()))
        .max()
        .unwrap_or(0);

    let has_data = |idx: usize| raw.rows.iter().any(|row| values::non_blank(row.cell(idx)).is_some());

    let mut headers: Vec<Option<String>> = (0..width)
        .map(|idx| {
            let header = raw.headers.get(idx).map(|h| h.trim()).unwrap_or_default();
            (!header.is_empty() && !unnamed.is_match(header)).then(|| header.to_string())
        })
        .collect();

    let unnamed_with_data: Vec<usize> = (0..width)
        .filter(|idx| headers[*idx].is_none() && has_data(*idx))
        .collect();

    let subject_idx = if options.rename_last_subject {
        unnamed_with_data.last().copied()
    } else {
        None
    };

    for idx in unnamed_with_data {
        let name = if Some(idx) == subject_idx {
            options
                .subject_column
                .clone()
                .unwrap_or_else(|| DEFAULT_SUBJECT_COLUMN.to_string())
        } else {
            format!("column_{}", idx + 1)
        };
        headers[idx] = Some(name);
    }

    let mut taken = IdentifierSet::new();
    for header in headers.iter_mut().flatten() {
        let cleaned = header.replace('\0', "");
        *header = taken.claim(&cleaned);
        identifiers::validate_column_name(header)?;
    }

    Ok(headers)
}
