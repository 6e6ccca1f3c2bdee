//! Thumbnail building: tone map, resize and JPEG encode a decoded buffer
//!
//! The longer edge of the output is scaled to the requested size with a
//! Lanczos filter and the aspect ratio is kept. Images already inside the box
//! are never upscaled. Alpha is composited onto white since JPEG has no alpha.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageReader, Rgb, RgbImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::buffer::{DecodedBuffer, Samples};
use crate::error::PipelineError;
use crate::tonemap::tone_map;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// Grid thumbnails, JPEG quality 85 by default
    Thumbnail,
    /// Full resolution (or capped) exports, JPEG quality 95 by default
    FullImage,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputKind::Thumbnail => write!(f, "thumbnail"),
            OutputKind::FullImage => write!(f, "full-image"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// Long edge of the output box; 0 keeps the source dimensions
    pub target_size: u32,
    pub quality: u8,
    pub gamma: f64,
}

/// An encoded image and its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub from_cache: bool,
}

impl Thumbnail {
    /// Rebuild a thumbnail from cached bytes, reading the dimensions from the
    /// JPEG header. Returns `None` for bytes that do not parse.
    pub fn from_cached(bytes: Vec<u8>) -> Option<Self> {
        let (width, height) = ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        Some(Self { bytes, width, height, from_cache: true })
    }
}

/// Build an encoded image from a decoded buffer.
pub fn build(buffer: DecodedBuffer, options: &BuildOptions) -> Result<Thumbnail, PipelineError> {
    let channels = buffer.channels();
    if !matches!(channels, 1 | 3 | 4) {
        return Err(PipelineError::UnsupportedShape { channels });
    }

    let buffer = tone_map(buffer, options.gamma)?;
    let img = to_dynamic_image(buffer)?;

    let (width, height) = fit_dimensions(img.width(), img.height(), options.target_size);
    let img = if (width, height) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(width, height, FilterType::Lanczos3)
    };

    let img = match img {
        DynamicImage::ImageRgba8(rgba) => DynamicImage::ImageRgb8(flatten_on_white(&rgba)),
        other => other,
    };

    let bytes = encode_jpeg(&img, options.quality)?;
    Ok(Thumbnail {
        bytes,
        width: img.width(),
        height: img.height(),
        from_cache: false,
    })
}

fn to_dynamic_image(buffer: DecodedBuffer) -> Result<DynamicImage, PipelineError> {
    let (width, height, channels) = (buffer.width(), buffer.height(), buffer.channels());
    let data = match buffer.into_samples() {
        Samples::U8(data) => data,
        // tone_map always yields 8-bit samples
        other => {
            return Err(PipelineError::Worker(format!(
                "expected 8-bit samples after tone mapping, got {:?}",
                other.kind()
            )))
        }
    };

    let img = match channels {
        1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
        other => return Err(PipelineError::UnsupportedShape { channels: other }),
    };
    img.ok_or(PipelineError::UnsupportedShape { channels })
}

/// Dimensions that fit `width`x`height` into a `target` box, keeping the aspect ratio
pub fn fit_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    let longest = width.max(height);
    if target == 0 || longest <= target {
        return (width, height);
    }

    let ratio = target as f64 / longest as f64;
    let scale = |dim: u32| ((dim as f64 * ratio).round() as u32).max(1);
    if width >= height {
        (target, scale(height))
    } else {
        (scale(width), target)
    }
}

/// Composite RGBA pixels over an opaque white background
fn flatten_on_white(rgba: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Encode image as JPEG with specified quality
fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, PipelineError> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    img.write_with_encoder(encoder)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tonemap::DEFAULT_GAMMA;
    use image::GenericImageView;

    fn options(target_size: u32) -> BuildOptions {
        BuildOptions { target_size, quality: 85, gamma: DEFAULT_GAMMA }
    }

    fn rgb_buffer(width: u32, height: u32) -> DecodedBuffer {
        let len = (width * height * 3) as usize;
        DecodedBuffer::new(width, height, 3, Samples::U8(vec![90; len])).unwrap()
    }

    #[test]
    fn test_fit_dimensions() {
        assert_eq!(fit_dimensions(4000, 2000, 200), (200, 100));
        assert_eq!(fit_dimensions(2000, 4000, 200), (100, 200));
        assert_eq!(fit_dimensions(1000, 800, 300), (300, 240));
        // Tiny short edge never rounds down to zero
        assert_eq!(fit_dimensions(5000, 3, 100), (100, 1));
        // No upscaling, and 0 means unconstrained
        assert_eq!(fit_dimensions(100, 80, 300), (100, 80));
        assert_eq!(fit_dimensions(6000, 4000, 0), (6000, 4000));
    }

    #[test]
    fn test_aspect_ratio_preserved() {
        for (w, h, target) in [(640, 480, 128), (333, 1000, 250), (1920, 1080, 200), (50, 50, 10)] {
            let (out_w, out_h) = fit_dimensions(w, h, target);
            assert_eq!(out_w.max(out_h), target);
            let expected = w as f64 / h as f64;
            let actual = out_w as f64 / out_h as f64;
            // Up to one pixel of rounding on the short edge
            let tolerance = expected / out_w.min(out_h) as f64 + 1e-9;
            assert!((expected - actual).abs() <= tolerance, "{w}x{h} -> {out_w}x{out_h}");
        }
    }

    #[test]
    fn test_build_resizes_and_encodes_jpeg() {
        let thumb = build(rgb_buffer(400, 200), &options(100)).unwrap();
        assert_eq!((thumb.width, thumb.height), (100, 50));
        assert!(!thumb.from_cache);
        assert_eq!(&thumb.bytes[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&thumb.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));
    }

    #[test]
    fn test_grayscale_stays_grayscale() {
        let buffer = DecodedBuffer::new(20, 10, 1, Samples::U8(vec![128; 200])).unwrap();
        let thumb = build(buffer, &options(10)).unwrap();
        let decoded = image::load_from_memory(&thumb.bytes).unwrap();
        assert_eq!(decoded.color(), image::ColorType::L8);
        assert_eq!(decoded.dimensions(), (10, 5));
    }

    #[test]
    fn test_transparent_pixels_become_white() {
        let buffer = DecodedBuffer::new(8, 8, 4, Samples::U8(vec![0; 8 * 8 * 4])).unwrap();
        let thumb = build(buffer, &options(0)).unwrap();
        let decoded = image::load_from_memory(&thumb.bytes).unwrap().to_rgb8();
        let Rgb([r, g, b]) = *decoded.get_pixel(4, 4);
        assert!(r > 245 && g > 245 && b > 245);
    }

    #[test]
    fn test_flatten_on_white() {
        let rgba = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128]));
        let rgb = flatten_on_white(&rgba);
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([127, 127, 127]));

        let opaque = RgbaImage::from_pixel(1, 1, Rgba([10, 20, 30, 255]));
        assert_eq!(*flatten_on_white(&opaque).get_pixel(0, 0), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_hdr_buffer_is_tone_mapped() {
        let buffer = DecodedBuffer::new(4, 4, 3, Samples::F32(vec![2.5; 48])).unwrap();
        let thumb = build(buffer, &options(2)).unwrap();
        assert_eq!((thumb.width, thumb.height), (2, 2));
    }

    #[test]
    fn test_unsupported_shape() {
        let buffer = DecodedBuffer::new(2, 2, 2, Samples::U8(vec![0; 8])).unwrap();
        let err = build(buffer, &options(1)).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedShape { channels: 2 }));
    }

    #[test]
    fn test_from_cached_reads_dimensions() {
        let thumb = build(rgb_buffer(30, 60), &options(20)).unwrap();
        let cached = Thumbnail::from_cached(thumb.bytes.clone()).unwrap();
        assert_eq!((cached.width, cached.height), (10, 20));
        assert!(cached.from_cache);

        assert!(Thumbnail::from_cached(b"garbage".to_vec()).is_none());
    }
}
