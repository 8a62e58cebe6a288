//! # Voice Coach Session
//!
//! Orchestrates one live coaching conversation: microphone → encoder → backend, and
//! backend → playback + transcript.
//!
//! ## Key Components:
//! - **machine**: `ConnectionStateMachine`, the only public entry point (start/stop)
//! - **resources**: `SessionResources`, everything a running session holds, released as a unit
//! - **pipeline**: The uplink and downlink tasks that move data while connected
//!
//! ## States:
//! ```text
//! Idle ──start()──▶ Connecting ──ready──▶ Connected ──closed/stop()──▶ Idle
//!                       │                     │
//!                       └──────error──────────┴──────▶ Error ──start()──▶ Connecting
//! ```

pub mod machine;    // ConnectionStateMachine
pub mod pipeline;   // Uplink / downlink tasks
pub mod resources;  // SessionResources aggregate

pub use machine::{ConnectionStateMachine, SessionSnapshot};

use crate::audio::capture::CaptureConfig;
use crate::transcript::TranscriptEntry;
use crate::transport::LiveConnectConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Where the conversation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Pushed to UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CoachEvent {
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
        session_id: Option<Uuid>,
    },
    TranscriptEntry(TranscriptEntry),
}

/// Everything `start()` needs to open a session, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub model_id: String,
    pub connect: LiveConnectConfig,
    pub capture: CaptureConfig,
    pub output_sample_rate: u32,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-ins for the microphone, the backend and the speaker.

    use super::*;
    use crate::audio::capture::{AudioCaptureSource, CaptureHandle, CaptureStream};
    use crate::audio::output::{AudioOutput, AudioOutputFactory};
    use crate::audio::playback::tests::ManualOutput;
    use crate::audio::AudioFrame;
    use crate::error::VoiceError;
    use crate::transport::{
        LiveBackend, LiveConnection, LiveSession, Outbound, ResponseModality, ServerMessage,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    pub(crate) fn settings() -> SessionSettings {
        SessionSettings {
            model_id: "test-model".to_string(),
            connect: LiveConnectConfig {
                response_modality: ResponseModality::Audio,
                voice_name: "Puck".to_string(),
                system_instruction: "Coach the user.".to_string(),
                input_transcription: true,
                output_transcription: true,
            },
            capture: CaptureConfig {
                sample_rate: 16_000,
                frame_size: 4,
                queue_frames: 64,
            },
            output_sample_rate: 24_000,
        }
    }

    /// How the fake microphone's stop behaves.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub(crate) enum StopBehavior {
        Clean,
        Fail,
        Panic,
    }

    pub(crate) struct FakeCapture {
        pub acquires: AtomicUsize,
        pub active: Arc<AtomicUsize>,
        pub fail_with: Mutex<Option<VoiceError>>,
        pub gate: Option<Arc<Notify>>,
        pub frames: Mutex<Option<mpsc::Sender<AudioFrame>>>,
        pub stop_behavior: StopBehavior,
    }

    impl FakeCapture {
        pub(crate) fn new() -> Self {
            Self {
                acquires: AtomicUsize::new(0),
                active: Arc::new(AtomicUsize::new(0)),
                fail_with: Mutex::new(None),
                gate: None,
                frames: Mutex::new(None),
                stop_behavior: StopBehavior::Clean,
            }
        }

        pub(crate) fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        pub(crate) fn frame_sender(&self) -> mpsc::Sender<AudioFrame> {
            self.frames.lock().unwrap().clone().expect("capture not acquired")
        }
    }

    #[async_trait]
    impl AudioCaptureSource for FakeCapture {
        async fn acquire(&self, config: &CaptureConfig) -> Result<CaptureStream, VoiceError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }

            let (tx, rx) = mpsc::channel(config.queue_frames);
            *self.frames.lock().unwrap() = Some(tx);
            self.active.fetch_add(1, Ordering::SeqCst);

            let active = Arc::clone(&self.active);
            let behavior = self.stop_behavior;
            let handle = CaptureHandle::new(
                move || {
                    active.fetch_sub(1, Ordering::SeqCst);
                    match behavior {
                        StopBehavior::Clean => Ok(()),
                        StopBehavior::Fail => Err(VoiceError::Teardown("microphone stuck".to_string())),
                        StopBehavior::Panic => panic!("microphone driver crashed"),
                    }
                },
                Arc::new(AtomicU64::new(0)),
            );
            Ok(CaptureStream { handle, frames: rx })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// The test's end of one fake session.
    pub(crate) struct FakeSession {
        pub session: LiveSession,
        pub outbound: mpsc::UnboundedReceiver<Outbound>,
        pub inbound: mpsc::Sender<ServerMessage>,
    }

    pub(crate) struct FakeBackend {
        pub connects: AtomicUsize,
        pub gate: Option<Arc<Notify>>,
        pub fail_with: Mutex<Option<VoiceError>>,
        pub sessions: Mutex<Vec<FakeSession>>,
    }

    impl FakeBackend {
        pub(crate) fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                gate: None,
                fail_with: Mutex::new(None),
                sessions: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn session(&self, index: usize) -> LiveSession {
            self.sessions.lock().unwrap()[index].session.clone()
        }

        pub(crate) fn inbound(&self, index: usize) -> mpsc::Sender<ServerMessage> {
            self.sessions.lock().unwrap()[index].inbound.clone()
        }

        pub(crate) fn take_outbound(&self, index: usize) -> Vec<Outbound> {
            let mut sessions = self.sessions.lock().unwrap();
            std::iter::from_fn(|| sessions[index].outbound.try_recv().ok()).collect()
        }
    }

    #[async_trait]
    impl LiveBackend for FakeBackend {
        async fn connect(&self, _model_id: &str, _config: &LiveConnectConfig) -> Result<LiveConnection, VoiceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }

            let (session, outbound) = LiveSession::channel();
            let (inbound_tx, inbound_rx) = mpsc::channel(64);
            self.sessions.lock().unwrap().push(FakeSession {
                session: session.clone(),
                outbound,
                inbound: inbound_tx,
            });
            Ok(LiveConnection {
                session,
                inbound: inbound_rx,
            })
        }
    }

    pub(crate) struct ManualOutputFactory {
        pub outputs: Mutex<Vec<Arc<ManualOutput>>>,
        pub fail_close: bool,
    }

    impl ManualOutputFactory {
        pub(crate) fn new() -> Self {
            Self {
                outputs: Mutex::new(Vec::new()),
                fail_close: false,
            }
        }

        pub(crate) fn open_count(&self) -> usize {
            self.outputs.lock().unwrap().iter().filter(|o| !o.is_closed()).count()
        }

        pub(crate) fn output(&self, index: usize) -> Arc<ManualOutput> {
            Arc::clone(&self.outputs.lock().unwrap()[index])
        }
    }

    #[async_trait]
    impl AudioOutputFactory for ManualOutputFactory {
        async fn open(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, VoiceError> {
            let mut output = ManualOutput::new(sample_rate);
            output.fail_close = self.fail_close;
            let output = Arc::new(output);
            self.outputs.lock().unwrap().push(Arc::clone(&output));
            Ok(output)
        }
    }

    /// Poll `condition` until it holds or two seconds pass.
    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }
}
