//! CSV artifacts: the canonical row snapshot and the rejected-rows export

use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::normalizer::CanonicalRow;
use super::validation::RejectedRow;
use crate::error::IngestResult;

/// Separator between reasons in the `errors` column
pub const REASON_SEPARATOR: &str = "; ";

pub fn write_canonical_rows(
    target: &Path,
    columns: &[String],
    rows: &[CanonicalRow],
) -> IngestResult<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(target)?;
    writer.write_record(std::iter::once("row_number").chain(columns.iter().map(String::as_str)))?;
    for row in rows {
        let row_number = row.row_number.to_string();
        writer.write_record(
            std::iter::once(row_number.as_str())
                .chain(row.values.iter().map(|v| v.as_deref().unwrap_or_default())),
        )?;
    }
    writer.flush()?;

    Ok(())
}

/// Write `{dir}/{job_id}.csv` with every rejected row and its reasons
///
/// Columns: `raw_id`, `row_number`, the business columns, then `errors`.
pub fn write_rejected_rows(
    dir: &Path,
    job_id: Uuid,
    columns: &[String],
    rejected: &[RejectedRow],
) -> IngestResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{job_id}.csv"));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(
        ["raw_id", "row_number"]
            .into_iter()
            .chain(columns.iter().map(String::as_str))
            .chain(std::iter::once("errors")),
    )?;

    for row in rejected {
        let mut record: Vec<String> = Vec::with_capacity(columns.len() + 3);
        record.push(row.raw_id.to_string());
        record.push(row.row_number.to_string());
        record.extend(row.values.iter().map(|v| v.clone().unwrap_or_default()));
        record.push(row.message(REASON_SEPARATOR));
        writer.write_record(&record)?;
    }
    writer.flush()?;

    tracing::info!(job_id = %job_id, rows = rejected.len(), path = %path.display(), "Rejected rows exported");
    Ok(path)
}
