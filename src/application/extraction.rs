use crate::domain::plate_pattern::PlatePattern;
use crate::domain::ports::{ObjectStorageHandle, TextDetectorHandle};
use crate::domain::toll_event::{
    DetectionKind, ObjectMetadata, ObjectRef, PlateDetection, TextDetection,
};
use crate::error::StageError;
use tracing::{debug, info};

/// Reads a number plate out of a stored image.
pub struct PlateExtractionStage {
    storage: ObjectStorageHandle,
    detector: TextDetectorHandle,
    min_confidence: u8,
}

impl PlateExtractionStage {
    pub fn new(
        storage: ObjectStorageHandle,
        detector: TextDetectorHandle,
        min_confidence: u8,
    ) -> Self {
        Self {
            storage,
            detector,
            min_confidence,
        }
    }

    /// Looks the object up, runs text detection once and scans the result.
    ///
    /// A failed metadata lookup aborts before detection is attempted.
    pub async fn extract(
        &self,
        object: &ObjectRef,
        pattern: &PlatePattern,
    ) -> Result<(ObjectMetadata, PlateDetection), StageError> {
        let metadata = self
            .storage
            .head_object(&object.bucket, &object.key)
            .await
            .map_err(|e| {
                StageError::ExtractionFailure(format!("Metadata lookup for {} failed: {}", object, e))
            })?;

        let detections = self
            .detector
            .detect_text(&object.bucket, &object.key)
            .await
            .map_err(|e| {
                StageError::ExtractionFailure(format!("Text detection for {} failed: {}", object, e))
            })?;
        debug!(object = %object, lines = detections.len(), "Text detection complete");

        let plate = scan_detections(&detections, pattern, self.min_confidence);
        if plate.detected {
            info!(
                object = %object,
                plate = %plate.plate,
                confidence = plate.confidence,
                "Number plate candidate"
            );
        } else {
            info!(object = %object, "No number plate above confidence threshold");
        }
        Ok((metadata, plate))
    }
}

/// First-match scan over detections in the order given.
///
/// Only `LINE` detections with confidence strictly above `min_confidence`
/// are tested. The first one the pattern matches wins; later candidates are
/// never looked at, even with higher confidence.
pub fn scan_detections(
    detections: &[TextDetection],
    pattern: &PlatePattern,
    min_confidence: u8,
) -> PlateDetection {
    let threshold = f32::from(min_confidence);
    detections
        .iter()
        .filter(|d| d.kind == DetectionKind::Line && d.confidence > threshold)
        .find_map(|d| {
            pattern
                .extract(&d.text)
                .map(|plate| PlateDetection::detected(plate, d.confidence, pattern.as_str()))
        })
        .unwrap_or_else(|| PlateDetection::not_detected(pattern.as_str()))
}
