use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// Errors produced while analysing an image
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image is empty")]
    EmptyImage,

    #[error("detection failed: {0}")]
    Failed(String),
}

/// What a detector found in one image
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    /// Number of persons found
    pub person_count: i64,
    /// Encoded image with the detections drawn on it, if one was produced
    pub visualization: Option<Vec<u8>>,
}

/// Finds persons in an uploaded image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersonDetector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<DetectionOutcome, DetectorError>;
}

/// Stand-in detector until a real model is wired in.
///
/// Reports a single person and returns the input unchanged as its
/// visualization.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderDetector;

#[async_trait]
impl PersonDetector for PlaceholderDetector {
    async fn detect(&self, image: &[u8]) -> Result<DetectionOutcome, DetectorError> {
        if image.is_empty() {
            return Err(DetectorError::EmptyImage);
        }

        trace!(size_bytes = image.len(), "Placeholder detection");

        Ok(DetectionOutcome {
            person_count: 1,
            visualization: Some(image.to_vec()),
        })
    }
}
