//! # Audio Pipeline Module
//!
//! Everything that touches raw audio on its way to and from the live backend:
//! microphone capture, PCM16 encoding, and gapless playback scheduling.
//!
//! ## Key Components:
//! - **Capture**: `AudioCaptureSource` implementations that emit fixed-size frames
//! - **Encoder**: Converts captured frames into base64 PCM16 chunks for the transport
//! - **Output**: The output clock and software mixer that plays scheduled buffers
//! - **Playback**: Schedules incoming model audio back-to-back on the output clock
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz, mono, sent as 16-bit little-endian PCM
//! - **Playback**: 24kHz, mono, received as 16-bit little-endian PCM
//! - **Internal**: 32-bit float samples in [-1.0, 1.0]

pub mod capture;      // Microphone / file capture sources
#[cfg(feature = "device-audio")]
pub mod device;       // cpal-backed capture and output
pub mod encoder;      // PCM16 + base64 framing
pub mod output;       // Output clock and software mixer
pub mod playback;     // Gapless playback scheduling

use std::sync::Arc;

/// Sample rate of captured microphone audio sent to the backend.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized audio received from the backend.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Number of samples in one captured block.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// An immutable block of mono float samples at a fixed sample rate.
///
/// ## Rust Concepts:
/// - **Arc<[f32]>**: Shared, immutable sample storage; cloning a frame only bumps a
///   reference count, so frames can move between the capture thread, the encoder and
///   the mixer without copying
/// - **No setters**: Once produced, a frame cannot be modified
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Create a frame from owned samples.
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples, for consumers that outlive the frame.
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame in seconds.
    ///
    /// ## Calculation:
    /// Duration = number_of_samples / sample_rate (mono, so samples == frames)
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
