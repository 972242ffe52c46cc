use std::cell::RefCell;

use crate::storage::{LocalBucket, ObjectEntry, ObjectStore, StorageError};

/// Wraps a bucket and fails uploads whose path contains `fail_on`.
pub struct FlakyStore {
    pub inner: LocalBucket,
    pub fail_on: &'static str,
    pub uploads: RefCell<Vec<String>>,
}

impl FlakyStore {
    pub fn new(inner: LocalBucket, fail_on: &'static str) -> Self {
        Self {
            inner,
            fail_on,
            uploads: RefCell::new(Vec::new()),
        }
    }
}

impl ObjectStore for FlakyStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        self.inner.list(prefix)
    }
    fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.download(path)
    }
    fn upload(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StorageError> {
        self.uploads.borrow_mut().push(path.to_string());
        if path.contains(self.fail_on) {
            return Err(StorageError::Io {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "quota exceeded"),
            });
        }
        self.inner.upload(path, bytes, overwrite)
    }
    fn public_url(&self, path: &str) -> String {
        self.inner.public_url(path)
    }
}
