use anyhow::{Context, Result};
use image::ImageFormat;
use std::path::Path;

use crate::documents::ANNOTATION_FOLDER_SUFFIX;
use crate::records::ImageRef;
use crate::storage::{EntryKind, ListingCache, ObjectStore};

/// Folder and image listings over one bucket, served through a listing cache.
pub struct Catalog<S> {
    store: S,
    cache: ListingCache,
}

impl<S: ObjectStore> Catalog<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: ListingCache::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Top-level dataset folders, sorted. Annotation folders are hidden.
    pub fn folders(&mut self) -> Result<Vec<String>> {
        let entries = self
            .cache
            .list(&self.store, "")
            .with_context(|| format!("failed to list bucket {}", self.store.bucket()))?;
        let mut folders: Vec<String> = entries
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::Folder)
            .map(|entry| entry.name)
            .filter(|name| !name.ends_with(ANNOTATION_FOLDER_SUFFIX))
            .collect();
        folders.sort();
        Ok(folders)
    }

    /// Images directly under `folder`, sorted by public address.
    pub fn images(&mut self, folder: &str) -> Result<Vec<ImageRef>> {
        let entries = self
            .cache
            .list(&self.store, folder)
            .with_context(|| format!("failed to list folder {folder}"))?;
        let mut images: Vec<ImageRef> = entries
            .into_iter()
            .filter(|entry| entry.kind == EntryKind::File && image_format(&entry.name).is_some())
            .map(|entry| {
                let url = self.store.public_url(&format!("{folder}/{}", entry.name));
                ImageRef::new(&entry.name, url)
            })
            .collect();
        images.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(images)
    }

    /// Drops cached listings for `folder` (or everything) so the next call
    /// hits the store again.
    pub fn refresh(&mut self, folder: Option<&str>) {
        match folder {
            Some(folder) => {
                self.cache.invalidate(self.store.bucket(), folder);
                self.cache.invalidate(self.store.bucket(), "");
            }
            None => self.cache.clear(),
        }
        log::info!("refreshed listings for {}", folder.unwrap_or("<all folders>"));
    }
}

/// Recognizes the image files the annotator shows: `.jpg`, `.jpeg` and
/// `.png`, any case.
pub fn image_format(name: &str) -> Option<ImageFormat> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" | "png" => ImageFormat::from_extension(&ext),
        _ => None,
    }
}
