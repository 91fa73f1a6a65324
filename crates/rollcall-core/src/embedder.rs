//! Face embedding backends.
//!
//! The embedding model is a fixed external function. [`Embedder`] is its seam;
//! [`OnnxEmbedder`] runs a FaceNet-style model on ONNX Runtime. The pixel
//! normalization is part of the [`EmbedderSpec`] and is fixed per deployment:
//! descriptors produced under different normalizations are not comparable.

use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_DIMENSION: usize = 128;
/// Lower bound on the per-crop standard deviation, so a flat crop does not divide by zero.
const MIN_STD: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected crop of {expected}x{expected}, got {width}x{height}")]
    CropSize { expected: u32, width: u32, height: u32 },
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pixel intensity scaling expected by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Per-crop zero mean, unit variance over all channels.
    Standardize,
    /// Divide by 255 into [0, 1].
    UnitRange,
}

/// Memory layout of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    Nhwc,
    Nchw,
}

/// Static description of an embedding backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmbedderSpec {
    /// Square input resolution in pixels.
    pub input_size: u32,
    pub normalization: Normalization,
    pub layout: TensorLayout,
    /// Output dimensionality; every stored and query descriptor must match it.
    pub dimension: usize,
}

impl EmbedderSpec {
    /// Keras FaceNet with per-image standardization.
    pub fn facenet() -> Self {
        Self {
            input_size: FACENET_INPUT_SIZE,
            normalization: Normalization::Standardize,
            layout: TensorLayout::Nhwc,
            dimension: FACENET_DIMENSION,
        }
    }

    /// FaceNet export trained on [0, 1] inputs.
    pub fn facenet_unit() -> Self {
        Self {
            normalization: Normalization::UnitRange,
            ..Self::facenet()
        }
    }
}

/// Turns a normalized face crop into a raw (not yet L2-normalized) vector.
pub trait Embedder {
    fn spec(&self) -> EmbedderSpec;

    /// `crop` is already resized to `spec().input_size` square.
    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>, EmbedderError>;
}

/// Build the model input tensor for `crop` under `spec`.
pub fn to_tensor(crop: &RgbImage, spec: &EmbedderSpec) -> Result<Array4<f32>, EmbedderError> {
    let size = spec.input_size;
    if crop.width() != size || crop.height() != size {
        return Err(EmbedderError::CropSize {
            expected: size,
            width: crop.width(),
            height: crop.height(),
        });
    }

    let (offset, scale) = match spec.normalization {
        Normalization::UnitRange => (0.0, 255.0),
        Normalization::Standardize => {
            let raw = crop.as_raw();
            let n = raw.len() as f32;
            let mean = raw.iter().map(|&p| p as f32).sum::<f32>() / n;
            let var = raw.iter().map(|&p| (p as f32 - mean).powi(2)).sum::<f32>() / n;
            (mean, var.sqrt().max(MIN_STD))
        }
    };

    let s = size as usize;
    let mut tensor = match spec.layout {
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, s, s, 3)),
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, s, s)),
    };
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = (pixel[c] as f32 - offset) / scale;
            match spec.layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
            }
        }
    }
    Ok(tensor)
}

/// FaceNet-style embedder on ONNX Runtime.
pub struct OnnxEmbedder {
    session: Session,
    spec: EmbedderSpec,
}

impl OnnxEmbedder {
    pub fn load(model_path: &str, spec: EmbedderSpec) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            ?spec,
            "loaded embedding model"
        );

        Ok(Self { session, spec })
    }
}

impl Embedder for OnnxEmbedder {
    fn spec(&self) -> EmbedderSpec {
        self.spec
    }

    fn embed(&mut self, crop: &RgbImage) -> Result<Vec<f32>, EmbedderError> {
        let input = to_tensor(crop, &self.spec)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.spec.dimension {
            return Err(EmbedderError::DimensionMismatch {
                expected: self.spec.dimension,
                actual: raw.len(),
            });
        }
        Ok(raw.to_vec())
    }
}
