//! Raw worksheet reading
//!
//! [`WorkbookReader`] turns a workbook file into header and row text without
//! any cleaning. The calamine-backed reader handles `.xlsx`, `.xlsm`, `.xls`
//! and `.ods`.

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveTime;
use std::path::Path;

use crate::error::{IngestError, IngestResult};

/// One worksheet as text, header row first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based row number as shown in the spreadsheet
    pub row_number: usize,
    pub cells: Vec<Option<String>>,
}

impl RawRow {
    pub fn cell(&self, idx: usize) -> Option<&str> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }
}

pub trait WorkbookReader: Send + Sync {
    fn sheet_names(&self, path: &Path) -> IngestResult<Vec<String>>;

    fn read_sheet(&self, path: &Path, sheet: &str) -> IngestResult<RawSheet>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalamineReader;

impl WorkbookReader for CalamineReader {
    fn sheet_names(&self, path: &Path) -> IngestResult<Vec<String>> {
        let workbook = open_workbook_auto(path)?;
        Ok(workbook.sheet_names().to_vec())
    }

    fn read_sheet(&self, path: &Path, sheet: &str) -> IngestResult<RawSheet> {
        let mut workbook = open_workbook_auto(path)?;
        if !workbook.sheet_names().iter().any(|name| name == sheet) {
            return Err(IngestError::Workbook(format!(
                "Worksheet '{sheet}' not found in {}",
                path.display()
            )));
        }

        let range = workbook.worksheet_range(sheet)?;
        let first_row = range.start().map_or(0, |(row, _)| row as usize);

        let mut rows = range.rows().enumerate().filter_map(|(idx, cells)| {
            let texts: Vec<Option<String>> = cells.iter().map(cell_text).collect();
            texts
                .iter()
                .any(Option::is_some)
                .then(|| (first_row + idx + 1, texts))
        });

        let Some((_, header_cells)) = rows.next() else {
            return Ok(RawSheet {
                sheet_name: sheet.to_string(),
                ..Default::default()
            });
        };

        Ok(RawSheet {
            sheet_name: sheet.to_string(),
            headers: header_cells.into_iter().map(Option::unwrap_or_default).collect(),
            rows: rows
                .map(|(row_number, cells)| RawRow { row_number, cells })
                .collect(),
        })
    }
}

/// Cell as text; `None` for empty cells
pub fn cell_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty => return None,
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        },
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == NaiveTime::MIN => ts.format("%Y-%m-%d").to_string(),
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    };

    Some(text)
}
