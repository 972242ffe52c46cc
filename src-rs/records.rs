use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

pub const DELETION_REASON: &str = "excluded from labeling";

/// Editable form fields, in display order.
pub const FORM_FIELDS: [&str; 6] = [
    "text_original",
    "text_latinized",
    "text_translation",
    "surah_name",
    "ayah_number",
    "comment",
];

const LEGACY_TRANSLATION_KEY: &str = "text_translation_tr";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown field `{0}` (expected one of: {})", FORM_FIELDS.join(", "))]
    UnknownField(String),
}

/// One image observed in a dataset folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub id: String,
    pub url: String,
}

impl ImageRef {
    /// The id comes from the stored object name, never from the address,
    /// which may be rewritten or carry characters with URL meaning.
    pub fn new(object_name: &str, url: impl Into<String>) -> Self {
        Self {
            id: record_id(object_name),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnnotationRecord {
    pub id: String,
    pub image_url: String,
    pub text_original: String,
    pub text_latinized: String,
    pub text_translation: String,
    pub surah_name: String,
    pub ayah_number: String,
    pub comment: String,
    /// Keys written by hand edits that are not form fields. Kept so a
    /// load/save cycle does not drop them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationRecord {
    pub fn blank(image: &ImageRef) -> Self {
        Self {
            id: image.id.clone(),
            image_url: image.url.clone(),
            ..Self::default()
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut record = Self::default();
        for (key, value) in map {
            let text = lenient_string(value);
            match key.as_str() {
                "id" => record.id = text,
                "image_url" => record.image_url = text,
                "text_original" => record.text_original = text,
                "text_latinized" => record.text_latinized = text,
                "text_translation" => record.text_translation = text,
                "surah_name" => record.surah_name = text,
                "ayah_number" => record.ayah_number = text,
                "comment" => record.comment = text,
                LEGACY_TRANSLATION_KEY => {
                    if !map.contains_key("text_translation") {
                        record.text_translation = text;
                    }
                }
                _ => {
                    record.extra.insert(key.clone(), value.clone());
                }
            }
        }
        record
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "text_original" => &self.text_original,
            "text_latinized" => &self.text_latinized,
            "text_translation" | LEGACY_TRANSLATION_KEY => &self.text_translation,
            "surah_name" => &self.surah_name,
            "ayah_number" => &self.ayah_number,
            "comment" => &self.comment,
            _ => return None,
        };
        Some(value.as_str())
    }

    pub fn set_field(&mut self, name: &str, value: impl Into<String>) -> Result<(), RecordError> {
        let slot = match name {
            "text_original" => &mut self.text_original,
            "text_latinized" => &mut self.text_latinized,
            "text_translation" | LEGACY_TRANSLATION_KEY => &mut self.text_translation,
            "surah_name" => &mut self.surah_name,
            "ayah_number" => &mut self.ayah_number,
            "comment" => &mut self.comment,
            other => return Err(RecordError::UnknownField(other.to_string())),
        };
        *slot = value.into();
        Ok(())
    }

    fn carry_fields_from(&mut self, other: &AnnotationRecord) {
        self.text_original = other.text_original.clone();
        self.text_latinized = other.text_latinized.clone();
        self.text_translation = other.text_translation.clone();
        self.surah_name = other.surah_name.clone();
        self.ayah_number = other.ayah_number.clone();
        self.comment = other.comment.clone();
        self.extra = other.extra.clone();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionRecord {
    pub id: String,
    pub image_url: String,
    pub reason: String,
}

impl DeletionRecord {
    pub fn excluded(image: &ImageRef) -> Self {
        Self {
            id: image.id.clone(),
            image_url: image.url.clone(),
            reason: DELETION_REASON.to_string(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        let text = |key: &str| map.get(key).map(lenient_string).unwrap_or_default();
        Self {
            id: text("id"),
            image_url: text("image_url"),
            reason: text("reason"),
        }
    }
}

/// Derives the record id of an image: its filename without the extension.
///
/// Only the last `/` segment counts; `?` and `#` are ordinary filename
/// characters. Leading dots belong to the stem, so `.hidden` keeps its full
/// name. Stems shared across extensions collide.
pub fn record_id(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let leading = name.len() - name.trim_start_matches('.').len();
    match name[leading..].rfind('.') {
        Some(pos) => name[..leading + pos].to_string(),
        None => name.to_string(),
    }
}

/// Coerces any decoded JSON value into a list of mapping objects.
///
/// `null` and scalars become empty, a single object becomes a singleton and
/// arrays keep only their object elements.
pub fn normalize_records(value: Value) -> Vec<Map<String, Value>> {
    match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub fn annotations_from_maps(maps: &[Map<String, Value>]) -> Vec<AnnotationRecord> {
    maps.iter().map(AnnotationRecord::from_map).collect()
}

pub fn deletions_from_maps(maps: &[Map<String, Value>]) -> Vec<DeletionRecord> {
    maps.iter().map(DeletionRecord::from_map).collect()
}

/// Builds one grid row per observed image, in observed order, carrying form
/// values from `existing` where ids match. The last duplicate id wins.
pub fn merge_rows(images: &[ImageRef], existing: &[AnnotationRecord]) -> Vec<AnnotationRecord> {
    let by_id: HashMap<&str, &AnnotationRecord> = existing
        .iter()
        .map(|record| (record.id.as_str(), record))
        .collect();

    images
        .iter()
        .map(|image| {
            let mut row = AnnotationRecord::blank(image);
            if let Some(base) = by_id.get(image.id.as_str()) {
                row.carry_fields_from(base);
            }
            row
        })
        .collect()
}

fn lenient_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
