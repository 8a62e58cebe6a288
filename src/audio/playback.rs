//! # Playback Scheduling
//!
//! Model audio arrives as a stream of independent PCM chunks. To play them as one
//! continuous voice, each chunk is scheduled to start exactly where the previous one
//! ends on the output clock.
//!
//! ## Scheduling Rule:
//! - `start = max(next_start_time, output.current_time())`
//! - `next_start_time = start + chunk_duration`
//!
//! While chunks keep arriving ahead of the clock they abut exactly (no gap, no
//! overlap). If the clock has already passed `next_start_time` (the model fell behind)
//! the chunk starts "now" instead of in the past.
//!
//! ## Barge-in:
//! `on_interrupted` hard-cuts every scheduled source and moves the cursor to the
//! current clock reading, so the next chunk starts immediately.

use crate::audio::encoder::decode_pcm16;
use crate::audio::output::{AudioOutput, SourceId};
use crate::error::VoiceError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Where one chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Schedules decoded chunks back-to-back on an `AudioOutput`.
///
/// ## State:
/// - **next_start_time**: Scheduling cursor on the output clock
/// - **active**: Sources that are scheduled or still playing
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    sample_rate: u32,
    next_start_time: f64,
    active: BTreeMap<SourceId, ScheduledSource>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let sample_rate = output.sample_rate();
        Self {
            output,
            sample_rate,
            next_start_time: 0.0,
            active: BTreeMap::new(),
        }
    }

    /// Decode a PCM16 chunk and schedule it after everything already queued.
    ///
    /// ## Errors:
    /// An undecodable chunk, or an output that refuses it, leaves the cursor and the
    /// active set untouched so the caller can log and carry on.
    pub fn on_audio_chunk(&mut self, bytes: &[u8]) -> Result<ScheduledSource, VoiceError> {
        let frame = decode_pcm16(bytes, self.sample_rate)?;
        self.reap_finished();

        let now = self.output.current_time();
        let start_time = self.next_start_time.max(now);
        let duration = frame.duration_secs();

        let id = self.output.play_at(frame, start_time)?;
        let source = ScheduledSource {
            id,
            start_time,
            duration,
        };

        self.next_start_time = start_time + duration;
        self.active.insert(id, source);
        Ok(source)
    }

    /// Stop everything immediately and reset the cursor to "now".
    ///
    /// Returns how many sources were cut.
    pub fn on_interrupted(&mut self) -> usize {
        let cut = self.stop_all();
        debug!("Playback interrupted, cut {} sources", cut);
        cut
    }

    /// Stop and forget every active source.
    pub fn stop_all(&mut self) -> usize {
        let cut = self.active.len();
        for id in self.active.keys() {
            self.output.stop(*id);
        }
        self.active.clear();
        self.next_start_time = self.output.current_time();
        cut
    }

    /// Drop sources whose end has already passed on the output clock.
    fn reap_finished(&mut self) {
        let now = self.output.current_time();
        self.active.retain(|_, source| source.end_time() > now);
    }

    /// Number of sources that are scheduled or still playing.
    pub fn active_sources(&mut self) -> usize {
        self.reap_finished();
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn output(&self) -> &Arc<dyn AudioOutput> {
        &self.output
    }
}
