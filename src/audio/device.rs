//! # Sound Card Endpoints
//!
//! Microphone capture and speaker output through cpal.
//!
//! `cpal::Stream` is not `Send`, so each stream is built on, and owned by, a dedicated
//! OS thread that parks until it is told to stop. The realtime callbacks only touch
//! lock-free channels and the mixer.
//!
//! Readiness comes back over a tokio oneshot that is awaited, and stopping only signals
//! the thread. Neither path blocks an async worker or a caller holding a lock.

use crate::audio::capture::{offer_frame, AudioCaptureSource, CaptureConfig, CaptureHandle, CaptureStream, FrameAssembler, downmix};
use crate::audio::output::{AudioOutput, AudioOutputFactory, MixerOutput, SourceId};
use crate::audio::AudioFrame;
use crate::error::VoiceError;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::AtomicU64;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

fn build_error(err: cpal::BuildStreamError) -> VoiceError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        return VoiceError::PermissionDenied;
    }
    VoiceError::DeviceUnavailable(text)
}

/// Default system microphone.
pub struct DeviceCaptureSource;

#[async_trait]
impl AudioCaptureSource for DeviceCaptureSource {
    async fn acquire(&self, config: &CaptureConfig) -> Result<CaptureStream, VoiceError> {
        let (frame_tx, frame_rx) = mpsc::channel(config.queue_frames.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), VoiceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let dropped = Arc::new(AtomicU64::new(0));
        let callback_dropped = Arc::clone(&dropped);
        let config = config.clone();

        thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_input_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable("no input device".to_string())));
                        return;
                    }
                };
                let channels = device
                    .default_input_config()
                    .map(|c| c.channels())
                    .unwrap_or(1);
                let stream_config = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(config.sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let mut assembler = FrameAssembler::new(config.frame_size, config.sample_rate);
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono = downmix(data, channels as usize);
                        assembler.push(&mono, |frame| {
                            offer_frame(&frame_tx, frame, &callback_dropped);
                        });
                    },
                    |err| error!("Input stream error: {}", err),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(build_error(e)));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                    return;
                }

                info!(
                    "Microphone open: {}Hz, {} channel(s), {} samples per frame",
                    config.sample_rate, channels, config.frame_size
                );
                let _ = ready_tx.send(Ok(()));

                // Park until stop() or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                info!("Microphone closed");
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(VoiceError::DeviceUnavailable("capture thread exited".to_string())),
        }

        // The thread drops the stream as soon as it sees the signal
        let handle = CaptureHandle::new(
            move || {
                stop_tx
                    .send(())
                    .map_err(|_| VoiceError::Teardown("capture thread already gone".to_string()))
            },
            dropped,
        );

        Ok(CaptureStream {
            handle,
            frames: frame_rx,
        })
    }

    fn name(&self) -> &'static str {
        "device"
    }
}

/// Mixer rendered by the default output device.
struct DeviceOutput {
    mixer: Arc<MixerOutput>,
    stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl AudioOutput for DeviceOutput {
    fn current_time(&self) -> f64 {
        self.mixer.current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.mixer.sample_rate()
    }

    fn play_at(&self, frame: AudioFrame, start_time: f64) -> Result<SourceId, VoiceError> {
        self.mixer.play_at(frame, start_time)
    }

    fn stop(&self, id: SourceId) {
        self.mixer.stop(id)
    }

    fn close(&self) -> Result<(), VoiceError> {
        self.mixer.close()?;
        let stop = self
            .stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.mixer.is_closed()
    }
}

/// Opens the default speaker for each session.
pub struct DeviceOutputFactory;

#[async_trait]
impl AudioOutputFactory for DeviceOutputFactory {
    async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, VoiceError> {
        let mixer = Arc::new(MixerOutput::new(sample_rate));
        let rendered = Arc::clone(&mixer);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), VoiceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let host = cpal::default_host();
                let device = match host.default_output_device() {
                    Some(device) => device,
                    None => {
                        let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable("no output device".to_string())));
                        return;
                    }
                };
                let channels = device
                    .default_output_config()
                    .map(|c| c.channels())
                    .unwrap_or(1)
                    .max(1);
                let stream_config = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let mut mono = Vec::new();
                let stream = device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / channels as usize;
                        mono.resize(frames, 0.0);
                        rendered.render(&mut mono);
                        for (out, sample) in data.chunks_mut(channels as usize).zip(mono.iter()) {
                            out.fill(*sample);
                        }
                    },
                    |err| error!("Output stream error: {}", err),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(build_error(e)));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot spawn output thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!("Output thread exited before reporting");
                return Err(VoiceError::DeviceUnavailable("output thread exited".to_string()));
            }
        }

        info!("Opened speaker output at {}Hz", sample_rate);
        Ok(Arc::new(DeviceOutput {
            mixer,
            stop: Mutex::new(Some(stop_tx)),
        }))
    }
}
