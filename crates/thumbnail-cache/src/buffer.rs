//! In-memory pixel buffers produced by the decoders

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer holds {actual} samples, expected {expected} for {width}x{height}x{channels}")]
    LengthMismatch {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
    #[error("buffer must have at least one channel")]
    NoChannels,
}

/// Numeric kind of each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleKind {
    U8,
    F32,
    F64,
}

impl SampleKind {
    /// Floating point samples are linear light and need tone mapping before display
    pub fn is_hdr(&self) -> bool {
        matches!(self, SampleKind::F32 | SampleKind::F64)
    }
}

/// Order of the color channels within a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOrder {
    /// R, G, B (and A), the canonical layout
    Rgb,
    /// B, G, R (and A)
    Bgr,
}

/// Interleaved sample data.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    U8(Vec<u8>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(data) => data.len(),
            Samples::F32(data) => data.len(),
            Samples::F64(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> SampleKind {
        match self {
            Samples::U8(_) => SampleKind::U8,
            Samples::F32(_) => SampleKind::F32,
            Samples::F64(_) => SampleKind::F64,
        }
    }
}

/// A decoded image: dimensions, channel layout and raw samples.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    width: u32,
    height: u32,
    channels: u8,
    order: ChannelOrder,
    samples: Samples,
}

impl DecodedBuffer {
    /// Build a buffer in canonical RGB order, checking the sample count against the shape
    pub fn new(width: u32, height: u32, channels: u8, samples: Samples) -> Result<Self, BufferError> {
        Self::with_order(width, height, channels, ChannelOrder::Rgb, samples)
    }

    pub fn with_order(
        width: u32,
        height: u32,
        channels: u8,
        order: ChannelOrder,
        samples: Samples,
    ) -> Result<Self, BufferError> {
        if channels == 0 {
            return Err(BufferError::NoChannels);
        }
        let expected = width as usize * height as usize * channels as usize;
        if samples.len() != expected {
            return Err(BufferError::LengthMismatch {
                width,
                height,
                channels,
                expected,
                actual: samples.len(),
            });
        }
        Ok(Self { width, height, channels, order, samples })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn kind(&self) -> SampleKind {
        self.samples.kind()
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    pub fn into_samples(self) -> Samples {
        self.samples
    }

    /// Replace the samples, keeping the shape. Used by the tone mapper.
    pub(crate) fn map_samples(self, f: impl FnOnce(Samples) -> Samples) -> Result<Self, BufferError> {
        let Self { width, height, channels, order, samples } = self;
        Self::with_order(width, height, channels, order, f(samples))
    }

    /// Rewrite BGR(A) pixels into RGB(A). Buffers that are already RGB, or that
    /// have neither 3 nor 4 channels, are returned unchanged.
    pub fn into_canonical_order(mut self) -> Self {
        if self.order == ChannelOrder::Rgb {
            return self;
        }
        let stride = self.channels as usize;
        if stride == 3 || stride == 4 {
            match &mut self.samples {
                Samples::U8(data) => swap_red_blue(data, stride),
                Samples::F32(data) => swap_red_blue(data, stride),
                Samples::F64(data) => swap_red_blue(data, stride),
            }
            self.order = ChannelOrder::Rgb;
        }
        self
    }
}

fn swap_red_blue<T>(data: &mut [T], stride: usize) {
    for pixel in data.chunks_exact_mut(stride) {
        pixel.swap(0, 2);
    }
}
