//! Image resizing and re-encoding
//!
//! Shrinks fetched product images to a bounded size, preserving aspect
//! ratio, and re-encodes them in their original format.

pub mod processor;

pub use processor::{fit_within, transform, ImageProcessor, TransformSettings};

use crate::fetch::SupportedFormat;

/// A re-encoded image ready for publishing.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: SupportedFormat,
}
