//! Ingest planner
//!
//! Operator tool for writing a new sheet configuration: summarises the header
//! row of every sheet and suggests staging column identifiers.

use serde::Serialize;
use std::path::Path;

use super::identifiers::{self, IdentifierSet};
use super::schema::{infer_type, ColumnType};
use super::workbook::{RawSheet, WorkbookReader};
use crate::error::IngestResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnPlan {
    pub position: usize,
    pub header: String,
    pub suggested: String,
    pub inferred_type: ColumnType,
    pub non_empty: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetPlan {
    pub sheet_name: String,
    pub data_rows: usize,
    pub columns: Vec<ColumnPlan>,
}

pub fn plan_sheet(raw: &RawSheet) -> SheetPlan {
    let mut taken = IdentifierSet::new();

    let columns = raw
        .headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            let base = identifiers::sanitize_identifier(header)
                .unwrap_or_else(|| format!("column_{}", idx + 1));
            let cells: Vec<&str> = raw.rows.iter().filter_map(|row| row.cell(idx)).collect();
            ColumnPlan {
                position: idx + 1,
                header: header.trim().to_string(),
                suggested: taken.claim(&base),
                inferred_type: infer_type(cells.iter().copied()),
                non_empty: cells.len(),
            }
        })
        .collect();

    SheetPlan {
        sheet_name: raw.sheet_name.clone(),
        data_rows: raw.rows.len(),
        columns,
    }
}

/// Plan every sheet of a workbook, in workbook order
pub fn plan_workbook(reader: &dyn WorkbookReader, path: &Path) -> IngestResult<Vec<SheetPlan>> {
    reader
        .sheet_names(path)?
        .iter()
        .map(|sheet| Ok(plan_sheet(&reader.read_sheet(path, sheet)?)))
        .collect()
}
