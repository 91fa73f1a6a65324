use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Norm below which a vector is treated as the zero vector.
const NORM_EPSILON: f32 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("incompatible descriptor: expected {expected} dimensions, got {actual}")]
    IncompatibleDescriptor { expected: usize, actual: usize },
    #[error("descriptor byte buffer has length {0}, not a multiple of 4")]
    RaggedBytes(usize),
    #[error("descriptor contains non-finite values")]
    NonFinite,
}

/// Axis-aligned bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Unit-normalized face descriptor.
///
/// Every constructor that accepts raw values L2-normalizes them, so two
/// descriptors can be compared with a plain dot product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// L2-normalize `raw` into a descriptor.
    ///
    /// The zero vector has no direction; it is kept as-is instead of dividing
    /// by zero, and [`is_degenerate`](Self::is_degenerate) reports it.
    pub fn normalized(raw: Vec<f32>) -> Self {
        Self { values: l2_normalize(raw) }
    }

    /// Decode a little-endian f32 buffer of exactly `dimension * 4` bytes.
    pub fn from_le_bytes(bytes: &[u8], dimension: usize) -> Result<Self, DescriptorError> {
        if bytes.len() % 4 != 0 {
            return Err(DescriptorError::RaggedBytes(bytes.len()));
        }
        let actual = bytes.len() / 4;
        if actual != dimension {
            return Err(DescriptorError::IncompatibleDescriptor {
                expected: dimension,
                actual,
            });
        }

        let mut raw = Vec::with_capacity(dimension);
        for chunk in bytes.chunks_exact(4) {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !value.is_finite() {
                return Err(DescriptorError::NonFinite);
            }
            raw.push(value);
        }
        Ok(Self::normalized(raw))
    }

    /// Encode as little-endian f32 bytes (`len() * 4` bytes).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.values.len() * 4);
        for value in &self.values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// True for the empty or zero vector, or one holding NaN or infinity.
    /// Such a descriptor matches nothing.
    pub fn is_degenerate(&self) -> bool {
        let norm = self.norm();
        !norm.is_finite() || norm < NORM_EPSILON
    }

    /// Cosine similarity in [-1, 1], i.e. `1 - cosine_distance`.
    ///
    /// Both sides are unit vectors, so this is the dot product. Always
    /// processes every dimension.
    pub fn similarity(&self, other: &Descriptor) -> Result<f32, DescriptorError> {
        if self.values.len() != other.values.len() {
            return Err(DescriptorError::IncompatibleDescriptor {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        let dot = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>();
        Ok(dot.clamp(-1.0, 1.0))
    }

    /// Component-wise mean of `descriptors`, re-normalized.
    ///
    /// Returns `None` for an empty slice or mixed dimensionality.
    pub fn mean(descriptors: &[Descriptor]) -> Option<Descriptor> {
        let first = descriptors.first()?;
        let dim = first.len();
        if descriptors.iter().any(|d| d.len() != dim) {
            return None;
        }

        let mut sum = vec![0.0f32; dim];
        for d in descriptors {
            for (acc, v) in sum.iter_mut().zip(d.values.iter()) {
                *acc += v;
            }
        }
        let n = descriptors.len() as f32;
        Some(Self::normalized(sum.into_iter().map(|v| v / n).collect()))
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < NORM_EPSILON {
        raw
    } else {
        raw.into_iter().map(|x| x / norm).collect()
    }
}

/// An enrolled person and their representative descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub display_name: String,
    pub descriptor: Descriptor,
    /// RFC 3339 enrollment timestamp.
    pub enrolled_at: String,
}

/// One gallery entry that cleared the similarity threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub identity_id: String,
    pub similarity: f32,
}
