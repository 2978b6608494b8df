//! Source image retrieval
//!
//! Downloads product images and validates their declared content type.
//! Decoding the downloaded bytes is also judged here: bytes that do not
//! parse as the declared format are a fetch-side `Decode` failure.

pub mod client;
pub mod mock;

pub use client::HttpFetcher;
pub use mock::MockFetcher;

use crate::{Error, Result};
use async_trait::async_trait;
use image::DynamicImage;

/// The two encodings the pipeline guarantees: lossy JPEG and lossless PNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    Jpeg,
    Png,
}

impl SupportedFormat {
    /// Match a `Content-Type` header value, ignoring parameters and case.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "image/jpeg" | "image/jpg" => Some(SupportedFormat::Jpeg),
            "image/png" => Some(SupportedFormat::Png),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            SupportedFormat::Jpeg => "image/jpeg",
            SupportedFormat::Png => "image/png",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            SupportedFormat::Jpeg => image::ImageFormat::Jpeg,
            SupportedFormat::Png => image::ImageFormat::Png,
        }
    }
}

/// Raw bytes of a source image together with its declared format.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub bytes: Vec<u8>,
    pub format: SupportedFormat,
}

impl FetchedImage {
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory_with_format(&self.bytes, self.format.image_format()).map_err(|e| {
            Error::Decode {
                url: self.url.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_matching() {
        assert_eq!(
            SupportedFormat::from_content_type("image/jpeg"),
            Some(SupportedFormat::Jpeg)
        );
        assert_eq!(
            SupportedFormat::from_content_type("Image/PNG; charset=binary"),
            Some(SupportedFormat::Png)
        );
        assert_eq!(
            SupportedFormat::from_content_type("image/jpg"),
            Some(SupportedFormat::Jpeg)
        );
        assert_eq!(SupportedFormat::from_content_type("image/gif"), None);
        assert_eq!(SupportedFormat::from_content_type(""), None);
    }

    #[test]
    fn test_decode_rejects_bytes_that_do_not_match_declared_format() {
        let fetched = FetchedImage {
            url: "http://x/a.png".to_string(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00],
            format: SupportedFormat::Png,
        };

        let err = fetched.decode().unwrap_err();
        assert!(matches!(err, Error::Decode { ref url, .. } if url == "http://x/a.png"));
        assert!(!err.is_retryable());
    }
}
