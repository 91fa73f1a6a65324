//! Image → descriptor.
//!
//! Localize the primary face, crop and resize it to the embedder's input
//! resolution, embed, check the output, L2-normalize.

use crate::detector::{select_primary, DetectorError, FaceDetector};
use crate::embedder::{Embedder, EmbedderError};
use crate::types::{BoundingBox, Descriptor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face found in image")]
    FaceNotFound,
    #[error("incompatible descriptor: expected {expected} dimensions, got {actual}")]
    IncompatibleDescriptor { expected: usize, actual: usize },
    #[error("embedder produced a non-finite value")]
    NonFinite,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Face descriptor extractor.
///
/// Owns the detector and embedder handles; they are loaded once by the caller
/// and reused for every call.
pub struct Extractor<D, E> {
    detector: D,
    embedder: E,
}

impl<D: FaceDetector, E: Embedder> Extractor<D, E> {
    pub fn new(detector: D, embedder: E) -> Self {
        Self { detector, embedder }
    }

    /// Output dimensionality of every descriptor this extractor produces.
    pub fn dimension(&self) -> usize {
        self.embedder.spec().dimension
    }

    pub fn extract(&mut self, image: &RgbImage) -> Result<Descriptor, ExtractError> {
        let faces = self.detector.detect(image)?;
        let face = select_primary(&faces).ok_or(ExtractError::FaceNotFound)?;
        tracing::debug!(
            faces = faces.len(),
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            "primary face selected"
        );

        let spec = self.embedder.spec();
        let crop = crop_face(image, face).ok_or(ExtractError::FaceNotFound)?;
        let crop = imageops::resize(&crop, spec.input_size, spec.input_size, FilterType::Triangle);

        let raw = self.embedder.embed(&crop)?;
        if raw.len() != spec.dimension {
            return Err(ExtractError::IncompatibleDescriptor {
                expected: spec.dimension,
                actual: raw.len(),
            });
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ExtractError::NonFinite);
        }

        Ok(Descriptor::normalized(raw))
    }
}

/// Crop `face` out of `image`, clamped to the image bounds.
///
/// Returns `None` when the box does not overlap the image by at least one pixel.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = face.x.max(0.0).floor();
    let y0 = face.y.max(0.0).floor();
    let x1 = (face.x + face.width).min(w).ceil();
    let y1 = (face.y + face.height).min(h).ceil();
    if !(x1 - x0 >= 1.0 && y1 - y0 >= 1.0) {
        return None;
    }
    Some(imageops::crop_imm(image, x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32).to_image())
}
