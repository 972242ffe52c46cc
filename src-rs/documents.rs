use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::records::normalize_records;
use crate::storage::{ObjectStore, StorageError};

pub const ANNOTATION_FOLDER_SUFFIX: &str = "_annotations";
pub const BACKUP_DIR: &str = "_backups";

/// The two canonical JSON documents kept beside every dataset folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DocumentKind {
    Annotations,
    Deleted,
}

impl DocumentKind {
    pub fn stem(self) -> &'static str {
        match self {
            Self::Annotations => "annotations",
            Self::Deleted => "deleted",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.json", self.stem())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub canonical_path: String,
    pub backup_path: String,
    pub records: usize,
}

pub fn annotation_folder(folder: &str) -> String {
    format!("{folder}{ANNOTATION_FOLDER_SUFFIX}")
}

pub fn document_path(folder: &str, kind: DocumentKind) -> String {
    format!("{}/{}", annotation_folder(folder), kind.file_name())
}

pub fn backup_path(folder: &str, kind: DocumentKind, at: DateTime<Utc>) -> String {
    format!(
        "{}/{BACKUP_DIR}/{}-{}.json",
        annotation_folder(folder),
        kind.stem(),
        at.format("%Y%m%d-%H%M%S")
    )
}

/// Reads a canonical document. A missing, unreadable or undecodable document
/// counts as empty; the cause is logged.
pub fn load_document<S: ObjectStore + ?Sized>(
    store: &S,
    folder: &str,
    kind: DocumentKind,
) -> Vec<Map<String, Value>> {
    let path = document_path(folder, kind);
    let bytes = match store.download(&path) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) => {
            log::info!("no existing {} in {}", kind.file_name(), annotation_folder(folder));
            return Vec::new();
        }
        Err(err) => {
            log::warn!("could not download {path}, starting empty: {err}");
            return Vec::new();
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => {
            let records = normalize_records(value);
            log::info!("loaded {path} ({} entries)", records.len());
            records
        }
        Err(err) => {
            log::warn!("{path} is not valid JSON, starting empty: {err}");
            Vec::new()
        }
    }
}

/// Pretty JSON, two-space indent, non-ASCII kept as-is.
pub fn encode_document<T: Serialize>(records: &[T]) -> Result<Vec<u8>> {
    let mut raw = serde_json::to_string_pretty(records).context("failed to encode document")?;
    raw.push('\n');
    Ok(raw.into_bytes())
}

/// Parses hand-edited document text and normalizes it into records.
pub fn parse_edited_document(text: &str) -> Result<Vec<Map<String, Value>>> {
    let value: Value = serde_json::from_str(text).context("invalid JSON")?;
    Ok(normalize_records(value))
}

/// Writes a timestamped backup, then overwrites the canonical document with
/// the same bytes. The canonical document is only touched once the backup
/// upload succeeded.
pub fn backup_then_overwrite<S, T>(
    store: &S,
    folder: &str,
    kind: DocumentKind,
    records: &[T],
    at: DateTime<Utc>,
) -> Result<SaveReport>
where
    S: ObjectStore + ?Sized,
    T: Serialize,
{
    let bytes = encode_document(records)?;

    let backup = backup_path(folder, kind, at);
    store
        .upload(&backup, &bytes, true)
        .with_context(|| format!("backup upload failed: {backup}"))?;

    let canonical = document_path(folder, kind);
    store
        .upload(&canonical, &bytes, true)
        .with_context(|| format!("upload failed: {canonical}"))?;

    log::info!(
        "saved {} records to {canonical} (backup {backup})",
        records.len()
    );
    Ok(SaveReport {
        canonical_path: canonical,
        backup_path: backup,
        records: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBucket;
    use crate::test_support::FlakyStore;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn paths_follow_layout() {
        assert_eq!(
            document_path("set1", DocumentKind::Annotations),
            "set1_annotations/annotations.json"
        );
        assert_eq!(
            backup_path("set1", DocumentKind::Deleted, at(7, 5, 3)),
            "set1_annotations/_backups/deleted-20240309-070503.json"
        );
    }

    #[test]
    fn encoding_is_pretty_and_keeps_non_ascii() {
        let bytes = encode_document(&[json!({"id": "a", "text_original": "بسم الله"})]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("بسم الله"));
        assert!(text.contains("\n  {\n    \"id\": \"a\""));
        assert!(text.ends_with("]\n"));
    }

    #[test]
    fn load_tolerates_missing_and_malformed_documents() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        assert!(load_document(&bucket, "set1", DocumentKind::Annotations).is_empty());

        bucket
            .upload("set1_annotations/annotations.json", b"{ not json", true)
            .unwrap();
        assert!(load_document(&bucket, "set1", DocumentKind::Annotations).is_empty());

        bucket
            .upload("set1_annotations/deleted.json", br#"{"id": "a"}"#, true)
            .unwrap();
        assert_eq!(load_document(&bucket, "set1", DocumentKind::Deleted).len(), 1);
    }

    #[test]
    fn parse_edited_document_reports_parser_detail() {
        let err = parse_edited_document("[{\"id\": }]").unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("invalid JSON"));
        assert!(message.contains("line 1"));

        assert!(parse_edited_document("\"not a list or object\"").unwrap().is_empty());
    }

    #[test]
    fn saves_backup_then_canonical() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        let records = vec![json!({"id": "a"})];

        let report =
            backup_then_overwrite(&bucket, "set1", DocumentKind::Annotations, &records, at(1, 2, 3))
                .unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(
            bucket.download(&report.backup_path).unwrap(),
            bucket.download(&report.canonical_path).unwrap()
        );
    }

    #[test]
    fn saves_in_distinct_seconds_keep_distinct_backups() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        let records = vec![json!({"id": "a"})];
        let backups = "set1_annotations/_backups";

        backup_then_overwrite(&bucket, "set1", DocumentKind::Annotations, &records, at(1, 2, 3)).unwrap();
        backup_then_overwrite(&bucket, "set1", DocumentKind::Annotations, &records, at(1, 2, 4)).unwrap();
        assert_eq!(bucket.list(backups).unwrap().len(), 2);

        // Same second: the later snapshot replaces the earlier one.
        backup_then_overwrite(&bucket, "set1", DocumentKind::Annotations, &records, at(1, 2, 4)).unwrap();
        assert_eq!(bucket.list(backups).unwrap().len(), 2);
    }

    #[test]
    fn failed_backup_leaves_canonical_untouched() {
        let dir = tempdir().unwrap();
        let store = FlakyStore::new(LocalBucket::new(dir.path(), "data", None), BACKUP_DIR);
        store
            .inner
            .upload("set1_annotations/annotations.json", b"[{\"id\":\"keep\"}]", true)
            .unwrap();

        let err = backup_then_overwrite(
            &store,
            "set1",
            DocumentKind::Annotations,
            &[json!({"id": "new"})],
            at(1, 2, 3),
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("quota exceeded"));
        assert_eq!(store.uploads.borrow().len(), 1);
        assert_eq!(
            store.inner.download("set1_annotations/annotations.json").unwrap(),
            b"[{\"id\":\"keep\"}]"
        );
    }

    #[test]
    fn failed_canonical_upload_is_reported() {
        let dir = tempdir().unwrap();
        let store = FlakyStore::new(LocalBucket::new(dir.path(), "data", None), "annotations.json");
        let err = backup_then_overwrite(
            &store,
            "set1",
            DocumentKind::Annotations,
            &[json!({"id": "new"})],
            at(1, 2, 3),
        )
        .unwrap_err();
        assert!(format!("{err:#}").starts_with("upload failed"));
    }
}
