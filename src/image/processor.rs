use super::TransformedImage;
use crate::fetch::{FetchedImage, SupportedFormat};
use crate::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSettings {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality (1-100); PNG output ignores it.
    pub quality: u8,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            max_width: 800,
            max_height: 600,
            quality: 75,
        }
    }
}

/// Dimensions of `width`x`height` scaled uniformly to fit inside the bound.
///
/// The scale is `min(1, max_width / width, max_height / height)`, so images
/// that already fit keep their size.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let scale = (max_width as f64 / width as f64)
        .min(max_height as f64 / height as f64)
        .min(1.0);
    if scale >= 1.0 {
        return (width, height);
    }

    let scaled = |dim: u32, bound: u32| ((dim as f64 * scale).round() as u32).clamp(1, bound.max(1));
    (scaled(width, max_width), scaled(height, max_height))
}

/// Resize `image` into the bound and encode it as `format`.
pub fn transform(
    image: &DynamicImage,
    format: SupportedFormat,
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> Result<TransformedImage> {
    let (orig_w, orig_h) = image.dimensions();
    let (width, height) = fit_within(orig_w, orig_h, max_width, max_height);

    let resized;
    let target = if (width, height) == (orig_w, orig_h) {
        image
    } else {
        resized = image.resize_exact(width, height, FilterType::Lanczos3);
        &resized
    };

    let mut bytes = Vec::new();
    match format {
        SupportedFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = target.to_rgb8();
            JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100)).encode_image(&rgb)?;
        }
        SupportedFormat::Png => {
            target.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        }
    }

    tracing::debug!(
        original_width = orig_w,
        original_height = orig_h,
        width,
        height,
        size = bytes.len(),
        "Transformed image"
    );

    Ok(TransformedImage {
        bytes,
        width,
        height,
        format,
    })
}

pub struct ImageProcessor {
    settings: TransformSettings,
}

impl ImageProcessor {
    pub fn new(settings: TransformSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> TransformSettings {
        self.settings
    }

    fn process_sync(fetched: FetchedImage, settings: TransformSettings) -> Result<TransformedImage> {
        let decoded = fetched.decode()?;
        transform(
            &decoded,
            fetched.format,
            settings.max_width,
            settings.max_height,
            settings.quality,
        )
    }

    /// Decode and transform on the blocking pool.
    pub async fn process(&self, fetched: FetchedImage) -> Result<TransformedImage> {
        let settings = self.settings;
        tokio::task::spawn_blocking(move || Self::process_sync(fetched, settings))
            .await
            .map_err(|e| Error::Invariant(format!("Image processing task join error: {}", e)))?
    }
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new(TransformSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([255, 0, 0, 255]),
        ))
    }

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }

    #[test]
    fn test_fit_within_landscape_binds_on_width() {
        assert_eq!(fit_within(1600, 900, 800, 800), (800, 450));
    }

    #[test]
    fn test_fit_within_portrait_binds_on_height() {
        assert_eq!(fit_within(900, 1600, 800, 800), (450, 800));
    }

    #[test]
    fn test_fit_within_uses_the_tighter_axis() {
        // 800/1000 = 0.8 vs 600/500 = 1.2, width binds
        assert_eq!(fit_within(1000, 500, 800, 600), (800, 400));
        // 800/1000 = 0.8 vs 600/900 = 0.667, height binds
        assert_eq!(fit_within(1000, 900, 800, 600), (667, 600));
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(100, 50, 800, 600), (100, 50));
        assert_eq!(fit_within(800, 600, 800, 600), (800, 600));
    }

    #[test]
    fn test_fit_within_preserves_aspect_ratio_within_a_pixel() {
        for &(w, h) in &[(1234, 567), (3000, 2999), (7, 5000), (5000, 7), (1025, 1023)] {
            let bound = 500;
            let (nw, nh) = fit_within(w, h, bound, bound);
            assert!(nw.max(nh) <= bound, "{}x{} -> {}x{}", w, h, nw, nh);
            assert!(nw >= 1 && nh >= 1);

            let expected_h = nw as f64 * h as f64 / w as f64;
            let expected_w = nh as f64 * w as f64 / h as f64;
            assert!(
                (nh as f64 - expected_h).abs() <= 1.0 || (nw as f64 - expected_w).abs() <= 1.0,
                "{}x{} -> {}x{}",
                w,
                h,
                nw,
                nh
            );
        }
    }

    #[test]
    fn test_transform_jpeg_shrinks_and_reencodes() {
        let source = create_test_image(1200, 900);

        let out = transform(&source, SupportedFormat::Jpeg, 800, 600, 75).unwrap();

        assert_eq!((out.width, out.height), (800, 600));
        let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (800, 600));
    }

    #[test]
    fn test_transform_png_keeps_small_images_at_size() {
        let source = create_test_image(40, 30);

        let out = transform(&source, SupportedFormat::Png, 800, 600, 10).unwrap();

        assert_eq!((out.width, out.height), (40, 30));
        let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Png).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
    }

    #[test]
    fn test_transform_lower_quality_gives_smaller_jpeg() {
        let mut noisy = image::RgbImage::new(256, 256);
        for (x, y, pixel) in noisy.enumerate_pixels_mut() {
            *pixel = image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8]);
        }
        let source = DynamicImage::ImageRgb8(noisy);

        let high = transform(&source, SupportedFormat::Jpeg, 800, 600, 95).unwrap();
        let low = transform(&source, SupportedFormat::Jpeg, 800, 600, 20).unwrap();

        assert!(low.bytes.len() < high.bytes.len());
    }

    #[tokio::test]
    async fn test_processor_decodes_and_transforms() {
        let processor = ImageProcessor::new(TransformSettings {
            max_width: 100,
            max_height: 100,
            quality: 80,
        });
        let fetched = FetchedImage {
            url: "http://x/a.png".to_string(),
            bytes: encode(&create_test_image(400, 200), ImageFormat::Png),
            format: SupportedFormat::Png,
        };

        let out = processor.process(fetched).await.unwrap();

        assert_eq!((out.width, out.height), (100, 50));
        assert_eq!(out.format, SupportedFormat::Png);
    }

    #[tokio::test]
    async fn test_processor_reports_decode_errors() {
        let processor = ImageProcessor::default();
        let fetched = FetchedImage {
            url: "http://x/a.jpg".to_string(),
            bytes: b"definitely not a jpeg".to_vec(),
            format: SupportedFormat::Jpeg,
        };

        let err = processor.process(fetched).await.unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
