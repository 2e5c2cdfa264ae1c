//! Sample codec: PCM16 <-> normalized f32, and binary <-> base64 text.
//!
//! Wire audio is little-endian signed 16-bit mono PCM carried as base64
//! inside JSON messages. Everything here is pure and stateless.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::error::CodecError;

/// Decode little-endian PCM16 bytes into samples in `[-1, 1)`.
///
/// # Errors
///
/// Returns [`CodecError::OddLength`] if `bytes` is not a whole number of samples.
pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
        .collect())
}

/// Encode samples as little-endian PCM16 bytes.
///
/// Samples are clamped to `[-1, 1]`. Positive values scale by 32767 and
/// negative values by 32768 so both rails map onto the full i16 range.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        let scaled = if s < 0.0 { s * 32_768.0 } else { s * 32_767.0 };
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// Encode binary data for transport inside a JSON string.
pub fn encode_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode transport text back to binary.
///
/// # Errors
///
/// Returns [`CodecError::Base64`] for malformed input.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    B64.decode(text.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))
}

/// Samples -> PCM16 -> base64, as sent in `audio_chunk.data`.
pub fn encode_samples(samples: &[f32]) -> String {
    encode_base64(&float_to_pcm16(samples))
}

/// base64 -> PCM16 -> samples, as received in `audio_chunk.data`.
///
/// # Errors
///
/// Fails on malformed base64 or an odd byte count.
pub fn decode_samples(text: &str) -> Result<Vec<f32>, CodecError> {
    pcm16_to_float(&decode_base64(text)?)
}

/// Scale samples in place by a fixed gain.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}
