//! Admission control, applied before any job record exists

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IngestError, IngestResult};

pub const ADMITTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls", "ods"];

const MIB: f64 = 1024.0 * 1024.0;

/// Upper bounds for one upload; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    pub max_file_size_bytes: Option<u64>,
    pub max_rows: Option<u64>,
}

impl AdmissionLimits {
    /// Configuration style constructor where `0` disables a limit
    pub fn from_config(max_file_size_bytes: u64, max_rows: u64) -> Self {
        Self {
            max_file_size_bytes: (max_file_size_bytes > 0).then_some(max_file_size_bytes),
            max_rows: (max_rows > 0).then_some(max_rows),
        }
    }

    /// Per-request overrides win, the rest falls back to `defaults`
    pub fn or(self, defaults: AdmissionLimits) -> Self {
        Self {
            max_file_size_bytes: self.max_file_size_bytes.or(defaults.max_file_size_bytes),
            max_rows: self.max_rows.or(defaults.max_rows),
        }
    }

    pub fn check_file_size(&self, file_size: Option<u64>) -> IngestResult<()> {
        if let (Some(size), Some(limit)) = (file_size, self.max_file_size_bytes) {
            if size > limit {
                return Err(IngestError::LimitExceeded(format!(
                    "File size {:.1} MiB exceeds limit of {:.1} MiB",
                    size as f64 / MIB,
                    limit as f64 / MIB
                )));
            }
        }
        Ok(())
    }

    pub fn check_rows(&self, row_count: Option<u64>) -> IngestResult<()> {
        if let (Some(rows), Some(limit)) = (row_count, self.max_rows) {
            if rows > limit {
                return Err(IngestError::LimitExceeded(format!(
                    "Workbook row count {} exceeds limit of {}",
                    group_thousands(rows),
                    group_thousands(limit)
                )));
            }
        }
        Ok(())
    }
}

/// `1234567` -> `1,234,567`
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Reject files whose extension calamine cannot read
pub fn check_extension(file_name: &str) -> IngestResult<()> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension {
        Some(ext) if ADMITTED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        _ => Err(IngestError::UnsupportedFile(format!(
            "'{file_name}' is not a spreadsheet (expected one of: {})",
            ADMITTED_EXTENSIONS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_size_message() {
        let limits = AdmissionLimits::from_config(1024 * 1024, 0);
        let err = limits.check_file_size(Some(3 * 1024 * 1024 / 2)).unwrap_err();
        assert_eq!(err.to_string(), "File size 1.5 MiB exceeds limit of 1.0 MiB");
        assert!(limits.check_file_size(Some(1024 * 1024)).is_ok());
        assert!(limits.check_file_size(None).is_ok());
    }

    #[test]
    fn test_zero_disables_and_overrides() {
        let defaults = AdmissionLimits::from_config(0, 100);
        assert_eq!(defaults.max_file_size_bytes, None);
        assert!(defaults.check_rows(Some(100)).is_ok());
        assert_eq!(
            defaults.check_rows(Some(101)).unwrap_err().to_string(),
            "Workbook row count 101 exceeds limit of 100"
        );

        let request = AdmissionLimits {
            max_file_size_bytes: Some(10),
            max_rows: None,
        };
        let merged = request.or(defaults);
        assert_eq!(merged.max_file_size_bytes, Some(10));
        assert_eq!(merged.max_rows, Some(100));
    }

    #[test]
    fn test_row_limit_message_groups_thousands() {
        let limits = AdmissionLimits::from_config(0, 500_000);
        assert_eq!(
            limits.check_rows(Some(1_234_567)).unwrap_err().to_string(),
            "Workbook row count 1,234,567 exceeds limit of 500,000"
        );
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
    }

    #[test]
    fn test_extensions() {
        assert!(check_extension("timetable.XLSX").is_ok());
        assert!(check_extension("calendar.ods").is_ok());
        assert!(matches!(
            check_extension("notes.csv"),
            Err(IngestError::UnsupportedFile(_))
        ));
        assert!(check_extension("no_extension").is_err());
    }
}
