//! # Session Data Paths
//!
//! The two tasks that run while a session is connected.
//!
//! ## Uplink:
//! capture frames → `FrameEncoder` → `LiveSession::send`, strictly one frame at a time
//! so frames reach the wire in capture order.
//!
//! ## Downlink:
//! `ServerMessage`s in arrival order →
//! - audio and interruptions to the `PlaybackScheduler`
//! - transcription fragments and turn ends to the `TranscriptAssembler`
//! - `Closed` / `Error` back to the state machine, which tears the session down

use crate::audio::encoder::FrameEncoder;
use crate::audio::playback::PlaybackScheduler;
use crate::audio::AudioFrame;
use crate::coach::machine::ConnectionStateMachine;
use crate::state::PipelineMetrics;
use crate::transcript::{Speaker, TranscriptAssembler};
use crate::transport::{LiveSession, ServerMessage};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) async fn run_uplink(
    mut frames: mpsc::Receiver<AudioFrame>,
    session: LiveSession,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(frame) = frames.recv().await {
        let chunk = FrameEncoder::encode(&frame);
        if session.send(chunk) {
            metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.frames_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
    debug!("Capture stream ended, uplink finished");
}

/// State owned by the downlink task.
pub(crate) struct Downlink {
    pub epoch: u64,
    pub machine: ConnectionStateMachine,
    pub playback: Arc<Mutex<PlaybackScheduler>>,
    pub assembler: TranscriptAssembler,
    pub metrics: Arc<PipelineMetrics>,
}

impl Downlink {
    pub(crate) async fn run(mut self, mut inbound: mpsc::Receiver<ServerMessage>) {
        while let Some(message) = inbound.recv().await {
            match message {
                ServerMessage::AudioChunk(bytes) => self.schedule(&bytes),
                ServerMessage::Interrupted => {
                    let cut = self.scheduler().on_interrupted();
                    self.metrics.interruptions.fetch_add(1, Ordering::Relaxed);
                    info!("User barged in, cut {} queued sources", cut);
                }
                ServerMessage::InputTranscriptFragment(text) => self.assembler.on_fragment(Speaker::User, &text),
                ServerMessage::OutputTranscriptFragment(text) => self.assembler.on_fragment(Speaker::Model, &text),
                ServerMessage::TurnComplete => {
                    let entries = self.assembler.on_turn_complete();
                    self.metrics.turns_completed.fetch_add(1, Ordering::Relaxed);
                    self.machine.publish_entries(self.epoch, entries);
                }
                ServerMessage::Closed => {
                    self.machine.finish(self.epoch, None);
                    return;
                }
                ServerMessage::Error(reason) => {
                    self.machine.finish(self.epoch, Some(reason));
                    return;
                }
            }
        }
        // The transport dropped its sender without a final message
        self.machine.finish(self.epoch, None);
    }

    fn scheduler(&self) -> std::sync::MutexGuard<'_, PlaybackScheduler> {
        self.playback.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule(&self, bytes: &[u8]) {
        let result = self.scheduler().on_audio_chunk(bytes);
        match result {
            Ok(source) => {
                self.metrics.chunks_scheduled.fetch_add(1, Ordering::Relaxed);
                debug!("Scheduled {:.3}s of audio at {:.3}s", source.duration, source.start_time);
            }
            Err(e) => {
                self.metrics.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping audio chunk of {} bytes: {}", bytes.len(), e);
            }
        }
    }
}
