//! Decoding source files into pixel buffers
//!
//! A [`Codec`] holds an ordered list of [`Decoder`]s and tries them in turn.
//! The first one is the [`NativeDecoder`], which keeps floating point samples
//! from EXR/HDR sources intact; the [`GenericDecoder`] behind it only ever
//! produces 8-bit buffers but opens anything the `image` crate can.

use image::{DynamicImage, ImageFormat, ImageReader};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::buffer::{DecodedBuffer, Samples};
use crate::error::{DecodeError, PipelineError};

pub trait Decoder: Send + Sync {
    /// Short identifier used in logs and diagnostics
    fn name(&self) -> &'static str;

    fn decode(&self, path: &Path) -> Result<DecodedBuffer, DecodeError>;
}

/// Refuse files over `max_size` before reading them into memory.
fn check_file_size(path: &Path, max_size: u64) -> Result<(), DecodeError> {
    let size = fs::metadata(path)?.len();
    if size > max_size {
        return Err(DecodeError::TooLarge { size, max: max_size });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NativeDecoderConfig {
    /// Whether OpenEXR sources are opened at all
    pub open_exr: bool,
    pub max_file_size: u64,
}

impl Default for NativeDecoderConfig {
    fn default() -> Self {
        Self {
            open_exr: true,
            max_file_size: 512 * 1024 * 1024,
        }
    }
}

/// Primary decoder: keeps the source layout, including 32-bit float samples.
#[derive(Debug, Clone, Default)]
pub struct NativeDecoder {
    config: NativeDecoderConfig,
}

impl NativeDecoder {
    pub fn new(config: NativeDecoderConfig) -> Self {
        Self { config }
    }
}

impl Decoder for NativeDecoder {
    fn name(&self) -> &'static str {
        "native"
    }

    fn decode(&self, path: &Path) -> Result<DecodedBuffer, DecodeError> {
        check_file_size(path, self.config.max_file_size)?;

        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader.format().ok_or(DecodeError::UnknownFormat)?;
        if format == ImageFormat::OpenExr && !self.config.open_exr {
            return Err(DecodeError::Disabled("OpenEXR"));
        }

        let img = reader.decode()?;
        native_buffer(img)
    }
}

/// Map a decoded image onto a buffer with 1, 3 or 4 channels, keeping float
/// samples as they are and narrowing 16-bit integers to 8 bits.
fn native_buffer(img: DynamicImage) -> Result<DecodedBuffer, DecodeError> {
    let (width, height) = (img.width(), img.height());
    let buffer = match img {
        DynamicImage::ImageLuma8(buf) => DecodedBuffer::new(width, height, 1, Samples::U8(buf.into_raw()))?,
        DynamicImage::ImageRgb8(buf) => DecodedBuffer::new(width, height, 3, Samples::U8(buf.into_raw()))?,
        DynamicImage::ImageRgba8(buf) => DecodedBuffer::new(width, height, 4, Samples::U8(buf.into_raw()))?,
        DynamicImage::ImageLuma16(buf) => {
            let data = buf.into_raw().into_iter().map(|v| (v >> 8) as u8).collect();
            DecodedBuffer::new(width, height, 1, Samples::U8(data))?
        }
        DynamicImage::ImageRgb16(buf) => {
            let data = buf.into_raw().into_iter().map(|v| (v >> 8) as u8).collect();
            DecodedBuffer::new(width, height, 3, Samples::U8(data))?
        }
        DynamicImage::ImageRgb32F(buf) => DecodedBuffer::new(width, height, 3, Samples::F32(buf.into_raw()))?,
        DynamicImage::ImageRgba32F(buf) => DecodedBuffer::new(width, height, 4, Samples::F32(buf.into_raw()))?,
        // Gray+alpha, 16-bit RGBA and anything newer become 8-bit RGBA
        other => DecodedBuffer::new(width, height, 4, Samples::U8(other.to_rgba8().into_raw()))?,
    };
    Ok(buffer)
}

/// Fallback decoder: anything the `image` crate opens, flattened to 8 bits.
#[derive(Debug, Clone)]
pub struct GenericDecoder {
    max_file_size: u64,
}

impl GenericDecoder {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

impl Default for GenericDecoder {
    fn default() -> Self {
        Self::new(NativeDecoderConfig::default().max_file_size)
    }
}

impl Decoder for GenericDecoder {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn decode(&self, path: &Path) -> Result<DecodedBuffer, DecodeError> {
        check_file_size(path, self.max_file_size)?;

        let img = image::open(path)?;
        let (width, height) = (img.width(), img.height());
        let color = img.color();

        let buffer = if color.has_alpha() {
            DecodedBuffer::new(width, height, 4, Samples::U8(img.to_rgba8().into_raw()))?
        } else if color.channel_count() == 1 {
            DecodedBuffer::new(width, height, 1, Samples::U8(img.to_luma8().into_raw()))?
        } else {
            DecodedBuffer::new(width, height, 3, Samples::U8(img.to_rgb8().into_raw()))?
        };
        Ok(buffer)
    }
}

/// A successful decode and the decoder that produced it.
#[derive(Debug)]
pub struct Decoded {
    pub buffer: DecodedBuffer,
    pub decoder: &'static str,
}

/// Ordered chain of decoders behind a single decode call.
pub struct Codec {
    decoders: Vec<Box<dyn Decoder>>,
}

impl Codec {
    pub fn new(decoders: Vec<Box<dyn Decoder>>) -> Self {
        Self { decoders }
    }

    /// The usual chain: native decoder first, generic decoder as fallback
    pub fn with_config(config: NativeDecoderConfig) -> Self {
        let max_file_size = config.max_file_size;
        Self::new(vec![
            Box::new(NativeDecoder::new(config)),
            Box::new(GenericDecoder::new(max_file_size)),
        ])
    }

    pub fn decoder_names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    /// Decode `path` with the first decoder that succeeds. The result is
    /// always in canonical RGB(A) order.
    pub fn decode(&self, path: &Path) -> Result<Decoded, PipelineError> {
        let mut attempts = Vec::with_capacity(self.decoders.len());

        for decoder in &self.decoders {
            match decoder.decode(path) {
                Ok(buffer) => {
                    return Ok(Decoded {
                        buffer: buffer.into_canonical_order(),
                        decoder: decoder.name(),
                    });
                }
                Err(e) => {
                    debug!(decoder = decoder.name(), path = %path.display(), error = %e, "decoder failed");
                    attempts.push(format!("{}: {}", decoder.name(), e));
                }
            }
        }

        Err(PipelineError::NotDecodable {
            path: path.to_path_buf(),
            attempts,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::with_config(NativeDecoderConfig::default())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("decoders", &self.decoder_names())
            .finish()
    }
}
