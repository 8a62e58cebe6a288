//! # Audio Output Clock
//!
//! The playback side of the pipeline needs two things from an output device: a clock
//! that says where playback currently is, and a way to start a buffer at an exact
//! position on that clock (and cut it off again). `AudioOutput` is that contract.
//!
//! ## Implementations:
//! - **MixerOutput**: A software mixer. Its clock is the number of frames it has
//!   rendered, so it only advances when a device (or the headless driver) pulls audio.
//! - **HeadlessOutputFactory**: Renders a `MixerOutput` on a tokio task paced by
//!   wall-clock time, for machines without a speaker.
//! - **DeviceOutputFactory** (`device-audio` feature): Renders a `MixerOutput` from a
//!   cpal output callback.

use crate::audio::AudioFrame;
use crate::error::VoiceError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Handle for one scheduled buffer on an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// An output device with its own clock.
///
/// ## Thread Safety:
/// Implementations are shared between the receive loop (scheduling), the teardown
/// path (closing) and the realtime render callback, so every method takes `&self`.
pub trait AudioOutput: Send + Sync {
    /// Current playback position in seconds.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Schedule `frame` to start at `start_time` on this output's clock.
    fn play_at(&self, frame: AudioFrame, start_time: f64) -> Result<SourceId, VoiceError>;

    /// Stop a scheduled source immediately. Unknown or finished ids are ignored.
    fn stop(&self, id: SourceId);

    /// Release the device. Idempotent.
    fn close(&self) -> Result<(), VoiceError>;

    fn is_closed(&self) -> bool;
}

/// Opens a fresh output (and clock) for each session.
///
/// Opening may wait on a device thread, so it is async and never blocks the caller's
/// runtime worker.
#[async_trait]
pub trait AudioOutputFactory: Send + Sync {
    async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, VoiceError>;
}

/// A buffer waiting in (or playing from) the mixer.
struct Voice {
    start_frame: u64,
    samples: Arc<[f32]>,
}

#[derive(Default)]
struct MixerState {
    rendered_frames: u64,
    next_id: u64,
    voices: BTreeMap<SourceId, Voice>,
}

/// Software mixer whose clock is driven by rendering.
///
/// ## How it works:
/// - `play_at` converts the start time to an absolute frame index on the output timeline
/// - `render` fills the next block of output by summing every voice that overlaps it,
///   then advances the clock by the block length
/// - Voices whose last frame has been rendered are dropped automatically
pub struct MixerOutput {
    sample_rate: u32,
    state: Mutex<MixerState>,
    closed: AtomicBool,
}

impl MixerOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(MixerState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        // A panic elsewhere must not take the audio thread down with it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render the next `out.len()` frames of mono output and advance the clock.
    ///
    /// ## Realtime Safety:
    /// Work is bounded by the number of scheduled voices; no allocation happens here.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut state = self.lock();
        let block_start = state.rendered_frames;
        let block_end = block_start + out.len() as u64;

        if !self.closed.load(Ordering::Acquire) {
            for voice in state.voices.values() {
                let voice_end = voice.start_frame + voice.samples.len() as u64;
                if voice_end <= block_start || voice.start_frame >= block_end {
                    continue;
                }
                let from = voice.start_frame.max(block_start);
                let to = voice_end.min(block_end);
                for frame in from..to {
                    let out_index = (frame - block_start) as usize;
                    let voice_index = (frame - voice.start_frame) as usize;
                    out[out_index] += voice.samples[voice_index];
                }
            }
            for sample in out.iter_mut() {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }

        state
            .voices
            .retain(|_, voice| voice.start_frame + voice.samples.len() as u64 > block_end);
        state.rendered_frames = block_end;
    }

    /// Number of sources that have not finished playing yet.
    pub fn active_voices(&self) -> usize {
        self.lock().voices.len()
    }
}

impl AudioOutput for MixerOutput {
    fn current_time(&self) -> f64 {
        self.lock().rendered_frames as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn play_at(&self, frame: AudioFrame, start_time: f64) -> Result<SourceId, VoiceError> {
        if self.is_closed() {
            return Err(VoiceError::OutputClosed);
        }
        let mut state = self.lock();
        // Never start in the past; the mixer cannot rewind
        let start_frame = ((start_time.max(0.0) * self.sample_rate as f64).round() as u64)
            .max(state.rendered_frames);

        state.next_id += 1;
        let id = SourceId(state.next_id);
        state.voices.insert(
            id,
            Voice {
                start_frame,
                samples: frame.shared_samples(),
            },
        );
        Ok(id)
    }

    fn stop(&self, id: SourceId) {
        self.lock().voices.remove(&id);
    }

    fn close(&self) -> Result<(), VoiceError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.lock().voices.clear();
            debug!("Mixer output closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Opens mixers that are rendered by a tokio task instead of a sound card.
///
/// ## Pacing:
/// Every tick the driver renders exactly as many frames as wall-clock time says
/// should have played, so the clock cannot drift even if a tick is late.
pub struct HeadlessOutputFactory {
    tick: Duration,
}

impl HeadlessOutputFactory {
    pub fn new() -> Self {
        Self {
            tick: Duration::from_millis(10),
        }
    }
}

impl Default for HeadlessOutputFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioOutputFactory for HeadlessOutputFactory {
    async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, VoiceError> {
        if sample_rate == 0 {
            return Err(VoiceError::DeviceUnavailable("output sample rate is 0".to_string()));
        }

        let mixer = Arc::new(MixerOutput::new(sample_rate));
        let driven = Arc::clone(&mixer);
        let tick = self.tick;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut rendered: u64 = 0;
            let mut scratch = Vec::new();
            let mut interval = tokio::time::interval(tick);

            while !driven.is_closed() {
                interval.tick().await;
                let due = (started.elapsed().as_secs_f64() * sample_rate as f64) as u64;
                if due > rendered {
                    scratch.resize((due - rendered) as usize, 0.0);
                    driven.render(&mut scratch);
                    rendered = due;
                }
            }
            debug!("Headless output driver stopped");
        });

        info!("Opened headless audio output at {}Hz", sample_rate);
        Ok(mixer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_places_voice_at_start_time() {
        let mixer = MixerOutput::new(10);
        mixer.play_at(AudioFrame::new(vec![0.5, 0.5, 0.5], 10), 0.2).unwrap();

        let mut block = vec![0.0; 4];
        mixer.render(&mut block);
        assert_eq!(block, vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(mixer.active_voices(), 1);

        mixer.render(&mut block);
        assert_eq!(block, vec![0.5, 0.0, 0.0, 0.0]);
        assert_eq!(mixer.active_voices(), 0);
        assert_eq!(mixer.current_time(), 0.8);
    }

    #[test]
    fn test_stop_cuts_voice() {
        let mixer = MixerOutput::new(10);
        let id = mixer.play_at(AudioFrame::new(vec![1.0; 8], 10), 0.0).unwrap();

        let mut block = vec![0.0; 2];
        mixer.render(&mut block);
        assert_eq!(block, vec![1.0, 1.0]);

        mixer.stop(id);
        mixer.render(&mut block);
        assert_eq!(block, vec![0.0, 0.0]);
    }

    #[test]
    fn test_overlapping_voices_are_mixed_and_clamped() {
        let mixer = MixerOutput::new(10);
        mixer.play_at(AudioFrame::new(vec![0.75; 2], 10), 0.0).unwrap();
        mixer.play_at(AudioFrame::new(vec![0.75; 2], 10), 0.1).unwrap();

        let mut block = vec![0.0; 3];
        mixer.render(&mut block);
        assert_eq!(block, vec![0.75, 1.0, 0.75]);
    }

    #[test]
    fn test_closed_output_rejects_sources() {
        let mixer = MixerOutput::new(10);
        mixer.play_at(AudioFrame::new(vec![1.0; 4], 10), 0.0).unwrap();
        mixer.close().unwrap();
        mixer.close().unwrap();

        assert!(mixer.is_closed());
        assert_eq!(mixer.active_voices(), 0);
        assert_eq!(
            mixer.play_at(AudioFrame::new(vec![1.0], 10), 0.0),
            Err(VoiceError::OutputClosed)
        );
    }

    #[tokio::test]
    async fn test_headless_output_advances_clock() {
        let factory = HeadlessOutputFactory::new();
        assert!(matches!(factory.open(0).await, Err(VoiceError::DeviceUnavailable(_))));

        let output = factory.open(24_000).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(output.current_time() > 0.0);

        output.close().unwrap();
        assert!(output.is_closed());
    }
}
