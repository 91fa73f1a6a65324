//! Canonical image input.
//!
//! Every entry point of the pipeline takes an [`RgbImage`]. Callers holding
//! encoded files or packed pixel buffers in another channel order convert
//! here, at the edge.

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid pixel buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Channel order of a packed 8-bit pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
    Gray,
}

impl ChannelOrder {
    pub fn channels(self) -> usize {
        match self {
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
            ChannelOrder::Gray => 1,
        }
    }
}

/// Convert a packed pixel buffer into the canonical RGB image.
pub fn from_raw(
    data: &[u8],
    width: u32,
    height: u32,
    order: ChannelOrder,
) -> Result<RgbImage, ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::Empty { width, height });
    }
    let expected = width as usize * height as usize * order.channels();
    if data.len() != expected {
        return Err(ImageError::InvalidLength {
            expected,
            actual: data.len(),
        });
    }

    let rgb: Vec<u8> = match order {
        ChannelOrder::Rgb => data.to_vec(),
        ChannelOrder::Bgr => data.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        ChannelOrder::Rgba => data.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect(),
        ChannelOrder::Bgra => data.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        ChannelOrder::Gray => data.iter().flat_map(|&y| [y, y, y]).collect(),
    };

    RgbImage::from_raw(width, height, rgb).ok_or(ImageError::InvalidLength {
        expected,
        actual: data.len(),
    })
}

/// Decode an encoded image (JPEG, PNG, ...) into the canonical RGB image.
///
/// The format is sniffed from the content, not from a file name.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, ImageError> {
    match image::load_from_memory(bytes)? {
        DynamicImage::ImageLuma8(gray) => from_gray(&gray),
        DynamicImage::ImageRgba8(rgba) => from_rgba(&rgba),
        other => ensure_not_empty(other.to_rgb8()),
    }
}

/// Read and decode an image file from disk.
pub fn load(path: impl AsRef<Path>) -> Result<RgbImage, ImageError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

pub fn from_gray(gray: &GrayImage) -> Result<RgbImage, ImageError> {
    from_raw(gray.as_raw(), gray.width(), gray.height(), ChannelOrder::Gray)
}

pub fn from_rgba(rgba: &RgbaImage) -> Result<RgbImage, ImageError> {
    from_raw(rgba.as_raw(), rgba.width(), rgba.height(), ChannelOrder::Rgba)
}

fn ensure_not_empty(img: RgbImage) -> Result<RgbImage, ImageError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageError::Empty {
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(img)
}
