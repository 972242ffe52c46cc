use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object already exists and overwrite is off: {0}")]
    AlreadyExists(String),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("storage I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ObjectEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Minimal object-storage surface the annotator needs from a bucket.
///
/// Paths are `/`-separated and relative to the bucket root.
pub trait ObjectStore {
    fn bucket(&self) -> &str;
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError>;
    fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    fn upload(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError>;
    fn public_url(&self, path: &str) -> String;
}

/// A bucket backed by a directory: `<root>/<bucket>/<object path>`.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    dir: PathBuf,
    bucket: String,
    public_base: Option<String>,
}

impl LocalBucket {
    pub fn new(root: &Path, bucket: &str, public_base: Option<String>) -> Self {
        Self {
            dir: abs_path(root).join(bucket),
            bucket: bucket.to_string(),
            public_base: public_base.map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let mut resolved = self.dir.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

impl ObjectStore for LocalBucket {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let dir = self.resolve(prefix)?;
        let reader = match fs::read_dir(&dir) {
            Ok(reader) => reader,
            // Buckets report an empty listing for prefixes with no objects.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(prefix, err)),
        };

        let mut entries = Vec::new();
        for item in reader {
            let item = item.map_err(|err| StorageError::io(prefix, err))?;
            let file_type = item.file_type().map_err(|err| StorageError::io(prefix, err))?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                log::warn!("skipping non UTF-8 object name under {prefix:?}");
                continue;
            };
            let kind = if file_type.is_dir() {
                EntryKind::Folder
            } else {
                EntryKind::File
            };
            entries.push(ObjectEntry { name, kind });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|err| StorageError::io(path, err))
    }

    fn upload(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if target == self.dir {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        if !overwrite && target.exists() {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(path, err))?;
        }
        fs::write(&target, bytes).map_err(|err| StorageError::io(path, err))?;
        log::debug!("uploaded {} bytes to {}/{}", bytes.len(), self.bucket, path);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        match &self.public_base {
            Some(base) => format!("{base}/{}/{path}", self.bucket),
            None => {
                let full = path
                    .split('/')
                    .filter(|part| !part.is_empty())
                    .fold(self.dir.clone(), |acc, part| acc.join(part));
                format!("file://{}", full.display())
            }
        }
    }
}

/// Listing results keyed by `(bucket, prefix)`. Entries live until they are
/// invalidated explicitly.
#[derive(Debug, Default)]
pub struct ListingCache {
    entries: HashMap<(String, String), Vec<ObjectEntry>>,
}

impl ListingCache {
    pub fn list<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, StorageError> {
        let key = (store.bucket().to_string(), prefix.to_string());
        if let Some(hit) = self.entries.get(&key) {
            return Ok(hit.clone());
        }
        let listed = store.list(prefix)?;
        self.entries.insert(key, listed.clone());
        Ok(listed)
    }

    pub fn invalidate(&mut self, bucket: &str, prefix: &str) -> bool {
        let removed = self
            .entries
            .remove(&(bucket.to_string(), prefix.to_string()))
            .is_some();
        if removed {
            log::debug!("invalidated listing cache for {bucket}/{prefix}");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upload_download_and_list_round_trip() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);

        bucket.upload("set1/a.jpg", b"img", false).unwrap();
        bucket.upload("set1_annotations/annotations.json", b"[]", true).unwrap();

        assert_eq!(bucket.download("set1/a.jpg").unwrap(), b"img");
        let root = bucket.list("").unwrap();
        assert_eq!(
            root,
            vec![
                ObjectEntry {
                    name: "set1".into(),
                    kind: EntryKind::Folder
                },
                ObjectEntry {
                    name: "set1_annotations".into(),
                    kind: EntryKind::Folder
                },
            ]
        );
        assert_eq!(bucket.list("set1").unwrap()[0].kind, EntryKind::File);
    }

    #[test]
    fn missing_objects_and_prefixes() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        assert!(matches!(
            bucket.download("nope/annotations.json"),
            Err(StorageError::NotFound(_))
        ));
        assert!(bucket.list("nope").unwrap().is_empty());
    }

    #[test]
    fn upload_respects_overwrite_flag() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        bucket.upload("f.json", b"1", false).unwrap();
        assert!(matches!(
            bucket.upload("f.json", b"2", false),
            Err(StorageError::AlreadyExists(_))
        ));
        bucket.upload("f.json", b"3", true).unwrap();
        assert_eq!(bucket.download("f.json").unwrap(), b"3");
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        assert!(matches!(
            bucket.upload("../outside.json", b"x", true),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            bucket.download("/etc/passwd"),
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[test]
    fn public_url_uses_base_when_configured() {
        let dir = tempdir().unwrap();
        let hosted = LocalBucket::new(dir.path(), "data", Some("https://cdn.test/public/".into()));
        assert_eq!(hosted.public_url("set1/a.jpg"), "https://cdn.test/public/data/set1/a.jpg");

        let local = LocalBucket::new(dir.path(), "data", None);
        let url = local.public_url("set1/a.jpg");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("a.jpg"));
    }

    #[test]
    fn cache_serves_stale_listing_until_invalidated() {
        let dir = tempdir().unwrap();
        let bucket = LocalBucket::new(dir.path(), "data", None);
        let mut cache = ListingCache::default();
        bucket.upload("set1/a.jpg", b"x", true).unwrap();

        assert_eq!(cache.list(&bucket, "set1").unwrap().len(), 1);
        bucket.upload("set1/b.jpg", b"x", true).unwrap();
        assert_eq!(cache.list(&bucket, "set1").unwrap().len(), 1);

        assert!(cache.invalidate("data", "set1"));
        assert!(!cache.invalidate("data", "set1"));
        assert_eq!(cache.list(&bucket, "set1").unwrap().len(), 2);
        cache.clear();
        assert!(!cache.invalidate("data", "set1"));
    }
}
