use super::ledger::Charge;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a captured image in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub content_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectionKind {
    Line,
    Word,
}

/// One piece of text reported by the text detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDetection {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: DetectionKind,
    /// Percentage in `0.0..=100.0`.
    pub confidence: f32,
}

impl TextDetection {
    pub fn line(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            kind: DetectionKind::Line,
            confidence,
        }
    }

    pub fn word(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            kind: DetectionKind::Word,
            confidence,
        }
    }
}

/// The plate read from an image, or from a human reviewer.
///
/// Never mutated once built. A reviewer's correction is a new value
/// appended to the run, so the machine reading stays on record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateDetection {
    pub detected: bool,
    pub plate: String,
    pub confidence: f32,
    pub pattern_used: String,
}

/// Marker recorded in `pattern_used` for plates supplied by a reviewer.
pub const MANUAL_REVIEW_PATTERN: &str = "manual-review";

impl PlateDetection {
    pub fn not_detected(pattern: impl Into<String>) -> Self {
        Self {
            detected: false,
            plate: String::new(),
            confidence: 0.0,
            pattern_used: pattern.into(),
        }
    }

    pub fn detected(plate: impl Into<String>, confidence: f32, pattern: impl Into<String>) -> Self {
        Self {
            detected: true,
            plate: plate.into(),
            confidence,
            pattern_used: pattern.into(),
        }
    }

    pub fn manual(plate: impl Into<String>) -> Self {
        Self::detected(plate, 100.0, MANUAL_REVIEW_PATTERN)
    }
}

/// What an inbound storage event asks the workflow to bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollRequest {
    pub object: ObjectRef,
    pub charge: Charge,
}

/// An ingested toll event: the image, its metadata and the machine reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TollEvent {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub content_length: u64,
    pub charge: Charge,
    pub plate: PlateDetection,
}

impl TollEvent {
    pub fn new(request: &TollRequest, metadata: ObjectMetadata, plate: PlateDetection) -> Self {
        Self {
            bucket: request.object.bucket.clone(),
            key: request.object.key.clone(),
            content_type: metadata.content_type,
            content_length: metadata.content_length,
            charge: request.charge,
            plate,
        }
    }

    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.key)
    }
}
