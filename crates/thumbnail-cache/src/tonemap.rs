//! Global tone mapping of floating point (HDR) buffers into 8-bit buffers
//!
//! Negative samples are clamped to zero, gamma correction is applied with an
//! exponent of `1 / gamma`, and the result is normalized by the peak sample of
//! the whole buffer before being scaled into `0..=255`.

use crate::buffer::{BufferError, DecodedBuffer, Samples};

pub const DEFAULT_GAMMA: f64 = 2.2;

/// Tone map `buffer` into 8-bit samples. 8-bit buffers are returned untouched.
pub fn tone_map(buffer: DecodedBuffer, gamma: f64) -> Result<DecodedBuffer, BufferError> {
    if !buffer.kind().is_hdr() {
        return Ok(buffer);
    }

    buffer.map_samples(|samples| match samples {
        Samples::U8(data) => Samples::U8(data),
        Samples::F32(data) => Samples::U8(map_to_u8(data.into_iter().map(f64::from), gamma)),
        Samples::F64(data) => Samples::U8(map_to_u8(data.into_iter(), gamma)),
    })
}

fn map_to_u8(values: impl Iterator<Item = f64>, gamma: f64) -> Vec<u8> {
    let exponent = 1.0 / gamma;
    // f64::max drops NaN in favour of the other operand, so NaN samples become 0
    let corrected: Vec<f64> = values.map(|v| v.max(0.0).powf(exponent)).collect();

    let peak = corrected.iter().copied().fold(0.0_f64, f64::max);
    let normalize = peak > 0.0;

    corrected
        .into_iter()
        .map(|v| {
            let v = if normalize { v / peak } else { v };
            // `as` saturates, so anything left above 1.0 truncates to 255
            (v * 255.0) as u8
        })
        .collect()
}
