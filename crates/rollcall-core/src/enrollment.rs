//! Registration-time averaging of several captures into one descriptor.

use crate::detector::FaceDetector;
use crate::embedder::Embedder;
use crate::extractor::{ExtractError, Extractor};
use crate::types::Descriptor;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment failed: no usable face in {0} image(s)")]
    EnrollmentFailed(usize),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Outcome of a successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// L2-normalized mean of the usable captures.
    pub descriptor: Descriptor,
    /// Number of images that contributed to the mean.
    pub used: usize,
    /// Indices of images skipped for having no detectable face.
    pub skipped: Vec<usize>,
}

/// Build one representative descriptor from several images of the same person.
///
/// Images without a detectable face are skipped. Any other extraction failure
/// aborts the attempt.
pub fn enroll<D: FaceDetector, E: Embedder>(
    extractor: &mut Extractor<D, E>,
    images: &[RgbImage],
) -> Result<Enrollment, EnrollmentError> {
    let mut descriptors = Vec::with_capacity(images.len());
    let mut skipped = Vec::new();

    for (idx, image) in images.iter().enumerate() {
        match extractor.extract(image) {
            Ok(d) => descriptors.push(d),
            Err(ExtractError::FaceNotFound) => {
                tracing::warn!(image = idx, "enroll: no face detected, skipping image");
                skipped.push(idx);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let descriptor = Descriptor::mean(&descriptors)
        .filter(|d| !d.is_degenerate())
        .ok_or(EnrollmentError::EnrollmentFailed(images.len()))?;

    tracing::info!(used = descriptors.len(), skipped = skipped.len(), "enrollment descriptor computed");

    Ok(Enrollment {
        descriptor,
        used: descriptors.len(),
        skipped,
    })
}
