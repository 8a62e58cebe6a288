//! # Frame Encoding
//!
//! Converts captured float frames into transport-ready chunks and decodes the
//! PCM16 payloads that come back from the backend.
//!
//! ## Wire Format:
//! - **Encoding**: 16-bit signed PCM, little-endian
//! - **Transport**: base64 text, tagged with a mime type such as `audio/pcm;rate=16000`
//!
//! ## Conversion:
//! Float samples are clamped to [-1.0, 1.0], scaled by 32768 and narrowed to `i16`
//! (truncating toward zero, saturating at `i16::MAX`). Decoding divides by 32768, so a
//! round trip is accurate to within one quantization step.

use crate::audio::AudioFrame;
use crate::error::VoiceError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

const PCM16_SCALE: f32 = 32768.0;

/// A transport-ready audio payload: base64 PCM16 plus its format tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedMediaChunk {
    /// Format tag, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// base64 of little-endian PCM16 samples
    pub data: String,
}

/// Mime type for PCM16 audio at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Stateless encoder from `AudioFrame` to `EncodedMediaChunk`.
pub struct FrameEncoder;

impl FrameEncoder {
    /// Encode one captured frame for the transport.
    ///
    /// ## Steps:
    /// 1. Clamp and narrow every sample to `i16`
    /// 2. Serialize little-endian
    /// 3. base64-encode and tag with the frame's sample rate
    pub fn encode(frame: &AudioFrame) -> EncodedMediaChunk {
        let pcm = float_to_pcm16(frame.samples());
        EncodedMediaChunk {
            mime_type: pcm_mime_type(frame.sample_rate()),
            data: STANDARD.encode(pcm16_to_le_bytes(&pcm)),
        }
    }

    /// Decode a chunk produced by `encode` back into a frame.
    pub fn decode(chunk: &EncodedMediaChunk, sample_rate: u32) -> Result<AudioFrame, VoiceError> {
        let bytes = STANDARD
            .decode(&chunk.data)
            .map_err(|e| VoiceError::Decode(format!("invalid base64: {}", e)))?;
        decode_pcm16(&bytes, sample_rate)
    }
}

/// Convert float samples to 16-bit PCM.
///
/// Out-of-range input is clamped before narrowing; NaN becomes silence.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            if sample.is_nan() {
                return 0;
            }
            // `as` truncates toward zero and saturates, so 1.0 * 32768 lands on 32767
            (sample.clamp(-1.0, 1.0) * PCM16_SCALE) as i16
        })
        .collect()
}

/// Convert 16-bit PCM samples to floats in [-1.0, 1.0).
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / PCM16_SCALE).collect()
}

fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Decode raw little-endian PCM16 bytes into a mono frame.
///
/// ## Errors:
/// - Empty payload
/// - Odd byte count (a truncated sample)
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<AudioFrame, VoiceError> {
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio payload".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "payload length {} is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / PCM16_SCALE);
    }

    Ok(AudioFrame::new(samples, sample_rate))
}
