use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::catalog::Catalog;
use crate::documents::{backup_then_overwrite, load_document, DocumentKind, SaveReport};
use crate::records::{
    annotations_from_maps, deletions_from_maps, merge_rows, AnnotationRecord, DeletionRecord,
    ImageRef,
};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum Position {
    At(usize),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Saved(Vec<SaveReport>),
    AlreadyAnnotated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Saved(Vec<SaveReport>),
    AlreadyDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub folder: String,
    pub images: usize,
    pub annotated: usize,
    pub deleted: usize,
    pub remaining: usize,
    pub position: Position,
}

/// Review state for one dataset folder: the observed images, both documents
/// and the navigation cursor. Owned by the caller and rebuilt on folder change.
#[derive(Debug, Clone)]
pub struct ReviewSession {
    folder: String,
    images: Vec<ImageRef>,
    annotations: Vec<AnnotationRecord>,
    deletions: Vec<DeletionRecord>,
    index: usize,
    exhausted: bool,
}

impl ReviewSession {
    pub fn open<S: ObjectStore>(catalog: &mut Catalog<S>, folder: &str) -> Result<Self> {
        let images = catalog.images(folder)?;
        let store = catalog.store();
        let annotations =
            annotations_from_maps(&load_document(store, folder, DocumentKind::Annotations));
        let deletions = deletions_from_maps(&load_document(store, folder, DocumentKind::Deleted));
        log::info!(
            "opened {folder}: {} images, {} annotations, {} deletions",
            images.len(),
            annotations.len(),
            deletions.len()
        );

        let mut session = Self {
            folder: folder.to_string(),
            images,
            annotations,
            deletions,
            index: 0,
            exhausted: false,
        };
        session.auto_skip();
        Ok(session)
    }

    /// Switches to `folder`, resetting the cursor and reloading both documents.
    pub fn select_folder<S: ObjectStore>(&mut self, catalog: &mut Catalog<S>, folder: &str) -> Result<()> {
        *self = Self::open(catalog, folder)?;
        Ok(())
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    pub fn annotations(&self) -> &[AnnotationRecord] {
        &self.annotations
    }

    pub fn deletions(&self) -> &[DeletionRecord] {
        &self.deletions
    }

    /// Grid view: one row per observed image.
    pub fn rows(&self) -> Vec<AnnotationRecord> {
        merge_rows(&self.images, &self.annotations)
    }

    pub fn position(&self) -> Position {
        if self.exhausted {
            Position::Exhausted
        } else {
            Position::At(self.index)
        }
    }

    pub fn current(&self) -> Option<&ImageRef> {
        match self.position() {
            Position::At(index) => self.images.get(index),
            Position::Exhausted => None,
        }
    }

    pub fn annotation(&self, id: &str) -> Option<&AnnotationRecord> {
        self.annotations.iter().find(|record| record.id == id)
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.annotations.iter().any(|record| record.id == id)
            || self.deletions.iter().any(|record| record.id == id)
    }

    /// Counts cover observed images only, so `annotated + deleted +
    /// remaining == images`. Records for ids missing from the folder are
    /// ignored.
    pub fn status(&self) -> SessionStatus {
        let annotated: HashSet<&str> = self.annotations.iter().map(|record| record.id.as_str()).collect();
        let deleted: HashSet<&str> = self.deletions.iter().map(|record| record.id.as_str()).collect();
        let (mut annotated_count, mut deleted_count) = (0, 0);
        for image in &self.images {
            if deleted.contains(image.id.as_str()) {
                deleted_count += 1;
            } else if annotated.contains(image.id.as_str()) {
                annotated_count += 1;
            }
        }
        SessionStatus {
            folder: self.folder.clone(),
            images: self.images.len(),
            annotated: annotated_count,
            deleted: deleted_count,
            remaining: self.images.len() - annotated_count - deleted_count,
            position: self.position(),
        }
    }

    pub fn next(&mut self) -> Position {
        if self.exhausted || self.images.is_empty() {
            return self.position();
        }
        self.index = (self.index + 1).min(self.images.len() - 1);
        self.auto_skip()
    }

    /// Steps back one image without skipping, so processed images can be
    /// revisited.
    pub fn back(&mut self) -> Position {
        if !self.exhausted {
            self.index = self.index.saturating_sub(1);
        }
        self.position()
    }

    /// Inserts `record` unless its id is already annotated, then persists and
    /// advances. A prior deletion of the same id is retracted.
    pub fn submit<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
        mut record: AnnotationRecord,
    ) -> Result<SubmitOutcome> {
        let Some(image) = self.image(&record.id).cloned() else {
            bail!("no image with id {:?} in folder {}", record.id, self.folder);
        };
        if self.annotation(&record.id).is_some() {
            log::info!("{} is already annotated, keeping the existing record", record.id);
            return Ok(SubmitOutcome::AlreadyAnnotated);
        }
        if record.image_url.is_empty() {
            record.image_url = image.url;
        }

        let previous = (self.annotations.clone(), self.deletions.clone());
        let id = record.id.clone();
        self.annotations.push(record);
        let retracted = self.retract_deletion(&id);

        let mut touched = Vec::with_capacity(2);
        if retracted {
            touched.push(DocumentKind::Deleted);
        }
        touched.push(DocumentKind::Annotations);
        let reports = self.persist_or_rollback(store, &touched, previous)?;
        self.auto_skip();
        Ok(SubmitOutcome::Saved(reports))
    }

    /// Marks `id` as excluded, then persists and advances. A prior annotation
    /// of the same id is retracted.
    pub fn delete<S: ObjectStore + ?Sized>(&mut self, store: &S, id: &str) -> Result<DeleteOutcome> {
        let Some(image) = self.image(id).cloned() else {
            bail!("no image with id {id:?} in folder {}", self.folder);
        };
        if self.deletions.iter().any(|record| record.id == id) {
            log::info!("{id} is already excluded");
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        let previous = (self.annotations.clone(), self.deletions.clone());
        self.deletions.push(DeletionRecord::excluded(&image));
        let before = self.annotations.len();
        self.annotations.retain(|record| record.id != id);

        let mut touched = Vec::with_capacity(2);
        if self.annotations.len() != before {
            touched.push(DocumentKind::Annotations);
        }
        touched.push(DocumentKind::Deleted);
        let reports = self.persist_or_rollback(store, &touched, previous)?;
        self.auto_skip();
        Ok(DeleteOutcome::Saved(reports))
    }

    /// Replaces a whole document with already-normalized records and persists
    /// them as given. Later edits win; nothing is merged.
    pub fn replace_document<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
        kind: DocumentKind,
        records: Vec<Map<String, Value>>,
    ) -> Result<SaveReport> {
        let report = backup_then_overwrite(store, &self.folder, kind, &records, Utc::now())?;
        match kind {
            DocumentKind::Annotations => self.annotations = annotations_from_maps(&records),
            DocumentKind::Deleted => self.deletions = deletions_from_maps(&records),
        }
        self.auto_skip();
        Ok(report)
    }

    fn image(&self, id: &str) -> Option<&ImageRef> {
        self.images.iter().find(|image| image.id == id)
    }

    fn retract_deletion(&mut self, id: &str) -> bool {
        let before = self.deletions.len();
        self.deletions.retain(|record| record.id != id);
        self.deletions.len() != before
    }

    /// Saves `kinds` in order. On failure, documents not yet written are
    /// restored from `previous` so memory keeps matching the store; the ones
    /// already written stay as saved. Callers list the retraction first, so
    /// a failure never leaves an id both annotated and deleted.
    fn persist_or_rollback<S: ObjectStore + ?Sized>(
        &mut self,
        store: &S,
        kinds: &[DocumentKind],
        previous: (Vec<AnnotationRecord>, Vec<DeletionRecord>),
    ) -> Result<Vec<SaveReport>> {
        let now = Utc::now();
        let (previous_annotations, previous_deletions) = previous;
        let mut reports = Vec::with_capacity(kinds.len());
        for (done, &kind) in kinds.iter().enumerate() {
            let saved = match kind {
                DocumentKind::Annotations => {
                    backup_then_overwrite(store, &self.folder, kind, &self.annotations, now)
                }
                DocumentKind::Deleted => {
                    backup_then_overwrite(store, &self.folder, kind, &self.deletions, now)
                }
            };
            match saved {
                Ok(report) => reports.push(report),
                Err(err) => {
                    for &unsaved in &kinds[done..] {
                        match unsaved {
                            DocumentKind::Annotations => self.annotations = previous_annotations.clone(),
                            DocumentKind::Deleted => self.deletions = previous_deletions.clone(),
                        }
                    }
                    log::warn!("save of {} in {} failed after {done} document(s)", kind.file_name(), self.folder);
                    return Err(err);
                }
            }
        }
        Ok(reports)
    }

    /// Moves the cursor to the first unprocessed image at or after it, then
    /// from the start. Exhausted once every image is processed.
    fn auto_skip(&mut self) -> Position {
        let target = {
            let processed: HashSet<&str> = self
                .annotations
                .iter()
                .map(|record| record.id.as_str())
                .chain(self.deletions.iter().map(|record| record.id.as_str()))
                .collect();
            let open = |i: &usize| !processed.contains(self.images[*i].id.as_str());
            let start = self.index.min(self.images.len());
            (start..self.images.len())
                .find(open)
                .or_else(|| (0..start).find(open))
        };

        match target {
            Some(index) => {
                self.index = index;
                self.exhausted = false;
            }
            None => {
                if !self.exhausted {
                    log::info!("all images in {} are processed", self.folder);
                }
                self.exhausted = true;
            }
        }
        self.position()
    }
}
