//! Upload directory: every admitted workbook gets a unique stored name

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::IngestResult;

#[derive(Debug, Clone)]
pub struct UploadStorage {
    dir: PathBuf,
}

impl UploadStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{uuid-hex}__{file name}`; any directory part of `original` is dropped
    pub fn stored_name(original: &str) -> String {
        let file_name = Path::new(original)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        format!("{}__{}", Uuid::new_v4().simple(), file_name)
    }

    /// Copy a workbook into the upload directory
    pub async fn store(&self, source: &Path, original: &str) -> IngestResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.dir.join(Self::stored_name(original));
        tokio::fs::copy(source, &target).await?;
        tracing::debug!(source = %source.display(), target = %target.display(), "Upload stored");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_name_layout() {
        let name = UploadStorage::stored_name("../incoming/Timetable 2024.xlsx");
        let (prefix, rest) = name.split_once("__").unwrap();
        assert_eq!(prefix.len(), 32);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "Timetable 2024.xlsx");
    }

    #[tokio::test]
    async fn test_store_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("book.xlsx");
        std::fs::write(&source, b"bytes").unwrap();

        let storage = UploadStorage::new(dir.path().join("uploads"));
        let stored = storage.store(&source, "book.xlsx").await.unwrap();

        assert!(stored.starts_with(storage.dir()));
        assert_eq!(std::fs::read(&stored).unwrap(), b"bytes");
    }
}
