//! # Audio Capture
//!
//! Capture sources hand the pipeline a stream of fixed-size mono frames at the input
//! sample rate, plus a handle that stops the stream.
//!
//! ## Contract:
//! - `acquire()` either returns a running stream or fails with `PermissionDenied` /
//!   `DeviceUnavailable`; there is no "half-acquired" state
//! - Frames arrive in capture order on a bounded channel
//! - The producer never waits on the consumer: if the channel is full the frame is
//!   dropped and counted, so a slow uplink can't stall the audio thread
//! - `CaptureHandle::stop()` is idempotent and also runs on drop
//!
//! ## Sources:
//! - **FileCaptureSource**: Replays a WAV file in real time, then keeps sending silence
//!   like an open microphone would
//! - **DeviceCaptureSource** (`device-audio` feature): The default input device via cpal

use crate::audio::AudioFrame;
use crate::error::VoiceError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Capture parameters requested by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Samples per second of the emitted frames
    pub sample_rate: u32,
    /// Samples per emitted frame
    pub frame_size: usize,
    /// Frames buffered between the capture thread and the uplink
    pub queue_frames: usize,
}

impl CaptureConfig {
    /// Wall-clock length of one frame.
    pub fn frame_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate as f64)
    }
}

type StopFn = Box<dyn FnOnce() -> Result<(), VoiceError> + Send>;

/// Owner of a running capture; stopping it ends the frame stream.
pub struct CaptureHandle {
    stop: Option<StopFn>,
    dropped: Arc<AtomicU64>,
}

impl CaptureHandle {
    pub fn new<F>(stop: F, dropped: Arc<AtomicU64>) -> Self
    where
        F: FnOnce() -> Result<(), VoiceError> + Send + 'static,
    {
        Self {
            stop: Some(Box::new(stop)),
            dropped,
        }
    }

    /// Stop capturing. Safe to call any number of times.
    pub fn stop(&mut self) -> Result<(), VoiceError> {
        match self.stop.take() {
            Some(stop) => stop(),
            None => Ok(()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_none()
    }

    /// Frames thrown away because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Capture stop on drop failed: {}", e);
        }
    }
}

/// A running capture: the stop handle and the frames it produces.
pub struct CaptureStream {
    pub handle: CaptureHandle,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Something that can open a microphone-like stream of frames.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: Lets the trait have an `async fn` while still being usable as
///   `Arc<dyn AudioCaptureSource>`
#[async_trait]
pub trait AudioCaptureSource: Send + Sync {
    async fn acquire(&self, config: &CaptureConfig) -> Result<CaptureStream, VoiceError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Cuts an arbitrary stream of samples into fixed-size frames.
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size: frame_size.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_size.max(1)),
        }
    }

    /// Append samples, calling `emit` once for every completed frame.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame::new(full, self.sample_rate));
            }
        }
    }

    /// Samples waiting for the current frame to fill up.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Hand one frame to the consumer without waiting.
///
/// Returns `false` once the consumer is gone.
pub(crate) fn offer_frame(tx: &mpsc::Sender<AudioFrame>, frame: AudioFrame, dropped: &AtomicU64) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Replays a WAV file as if it were a live microphone.
///
/// ## Supported Files:
/// - 16/24/32-bit integer PCM or 32-bit float
/// - Any channel count (downmixed to mono)
/// - Sample rate must equal the requested capture rate; there is no resampling
pub struct FileCaptureSource {
    path: PathBuf,
}

impl FileCaptureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Read a WAV file into mono float samples and its sample rate.
fn load_wav(path: &Path) -> Result<(Vec<f32>, u32), VoiceError> {
    let mut reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
    let spec = reader.spec();
    debug!("Loading capture file {:?}, spec: {:?}", path, spec);

    let interleaved: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|sample| sample as f32 / 32768.0))
                .collect(),
            24 | 32 => {
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|sample| sample as f32 / scale))
                    .collect()
            }
            other => {
                return Err(VoiceError::DeviceUnavailable(format!(
                    "unsupported WAV bit depth: {}",
                    other
                )))
            }
        },
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
    };

    let interleaved = interleaved.map_err(|e| wav_error(path, e))?;
    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

fn wav_error(path: &Path, err: hound::Error) -> VoiceError {
    match err {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            VoiceError::PermissionDenied
        }
        other => VoiceError::DeviceUnavailable(format!("cannot read {:?}: {}", path, other)),
    }
}

#[async_trait]
impl AudioCaptureSource for FileCaptureSource {
    async fn acquire(&self, config: &CaptureConfig) -> Result<CaptureStream, VoiceError> {
        if config.frame_size == 0 || config.sample_rate == 0 {
            return Err(VoiceError::Config("capture frame size and rate must be non-zero".to_string()));
        }

        let path = self.path.clone();
        let (samples, file_rate) = tokio::task::spawn_blocking(move || load_wav(&path))
            .await
            .map_err(|e| VoiceError::DeviceUnavailable(format!("capture loader failed: {}", e)))??;

        if file_rate != config.sample_rate {
            return Err(VoiceError::DeviceUnavailable(format!(
                "capture file is {}Hz, expected {}Hz",
                file_rate, config.sample_rate
            )));
        }

        let mut frames = Vec::with_capacity(samples.len() / config.frame_size + 1);
        let mut assembler = FrameAssembler::new(config.frame_size, config.sample_rate);
        assembler.push(&samples, |frame| frames.push(frame));
        if assembler.pending() > 0 {
            let silence = vec![0.0; config.frame_size - assembler.pending()];
            assembler.push(&silence, |frame| frames.push(frame));
        }
        let silence = AudioFrame::new(vec![0.0; config.frame_size], config.sample_rate);

        let (tx, rx) = mpsc::channel(config.queue_frames.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let task_dropped = Arc::clone(&dropped);
        let period = config.frame_duration();

        info!(
            "Replaying {:?} as capture: {} frames of {} samples",
            self.path,
            frames.len(),
            config.frame_size
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut recorded = frames.into_iter();

            loop {
                interval.tick().await;
                let frame = recorded.next().unwrap_or_else(|| silence.clone());
                if !offer_frame(&tx, frame, &task_dropped) {
                    debug!("Capture consumer went away");
                    break;
                }
            }
        });

        let handle = CaptureHandle::new(
            move || {
                task.abort();
                Ok(())
            },
            dropped,
        );

        Ok(CaptureStream { handle, frames: rx })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn write_wav(path: &Path, channels: u16, sample_rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn capture_config(frame_size: usize) -> CaptureConfig {
        CaptureConfig {
            sample_rate: 16_000,
            frame_size,
            queue_frames: 8,
        }
    }

    #[test]
    fn test_offer_frame_drops_when_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = AtomicU64::new(0);

        assert!(offer_frame(&tx, AudioFrame::new(vec![0.1; 4], 16_000), &dropped));
        // Full queue: the frame is thrown away and the producer carries on
        assert!(offer_frame(&tx, AudioFrame::new(vec![0.2; 4], 16_000), &dropped));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);

        let kept = rx.try_recv().unwrap();
        assert_eq!(kept.samples(), &[0.1; 4]);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!offer_frame(&tx, AudioFrame::new(vec![0.3; 4], 16_000), &dropped));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_assembler_emits_fixed_frames() {
        let mut assembler = FrameAssembler::new(4, 16_000);
        let mut frames = Vec::new();

        assembler.push(&[0.1, 0.2, 0.3], |f| frames.push(f));
        assert!(frames.is_empty());
        assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], |f| frames.push(f));

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples(), &[0.5, 0.6, 0.7, 0.8]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25, -0.25], 1), vec![0.25, -0.25]);
    }

    #[test]
    fn test_handle_stop_is_idempotent() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let mut handle = CaptureHandle::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Arc::new(AtomicU64::new(0)),
        );

        assert!(handle.stop().is_ok());
        assert!(handle.stop().is_ok());
        assert!(handle.is_stopped());
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_file_capture_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        let samples: Vec<i16> = (0..10).map(|i| i * 1000).collect();
        write_wav(&path, 1, 16_000, &samples);

        let source = FileCaptureSource::new(&path);
        let mut stream = source.acquire(&capture_config(4)).await.unwrap();

        let first = timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap().unwrap();
        let third = timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap().unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(first.samples()[1], 1000.0 / 32768.0);
        assert_eq!(second.samples()[0], 4000.0 / 32768.0);
        // Last partial frame is padded with silence
        assert_eq!(third.samples(), &[8000.0 / 32768.0, 9000.0 / 32768.0, 0.0, 0.0]);

        // Then the open-mic silence starts
        let fourth = timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap().unwrap();
        assert!(fourth.samples().iter().all(|&s| s == 0.0));

        stream.handle.stop().unwrap();
        let ended = timeout(Duration::from_secs(1), async {
            while stream.frames.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test]
    async fn test_file_capture_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, 16_000, &[16384, 0, 16384, 0]);

        let mut stream = FileCaptureSource::new(&path)
            .acquire(&capture_config(2))
            .await
            .unwrap();
        let frame = timeout(Duration::from_secs(1), stream.frames.recv()).await.unwrap().unwrap();
        assert_eq!(frame.samples(), &[0.25, 0.25]);
    }

    #[tokio::test]
    async fn test_file_capture_rejects_wrong_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fast.wav");
        write_wav(&path, 1, 44_100, &[0; 64]);

        let result = FileCaptureSource::new(&path).acquire(&capture_config(4)).await;
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let result = FileCaptureSource::new("/definitely/not/here.wav")
            .acquire(&capture_config(4))
            .await;
        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));
    }
}
