//! # Connection State Machine
//!
//! Owns the lifecycle of the coaching conversation and the one `SessionResources`
//! aggregate that exists while it is Connecting or Connected.
//!
//! ## Concurrency Model:
//! - `start()` is the only operation that awaits (microphone, backend, speaker). The
//!   aggregate lives in the machine from the moment the state becomes Connecting, and
//!   each piece is attached to it as soon as it is acquired
//! - Every `start()` gets an epoch number. `stop()` and session-ending events bump or
//!   check the epoch, so a `start()` overtaken by `stop()` releases whatever it acquires
//!   afterwards and reports `Cancelled`
//! - The core lock is a `std::sync::Mutex` and is never held across an `.await`
//!
//! ## Rust Concepts:
//! - **Arc<Shared>**: The machine is a cheap `Clone` handle; HTTP handlers, the WebSocket
//!   feed and the downlink task all hold one
//! - **broadcast**: Every subscriber sees every state change and transcript entry

use crate::audio::capture::{AudioCaptureSource, CaptureStream};
use crate::audio::output::AudioOutputFactory;
use crate::audio::playback::PlaybackScheduler;
use crate::coach::pipeline::{run_uplink, Downlink};
use crate::coach::resources::SessionResources;
use crate::coach::{CoachEvent, ConnectionState, SessionSettings};
use crate::error::VoiceError;
use crate::state::PipelineMetrics;
use crate::transcript::{TranscriptAssembler, TranscriptEntry};
use crate::transport::{LiveBackend, LiveConnection};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Point-in-time view of the machine for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub session_id: Option<Uuid>,
}

struct Core {
    state: ConnectionState,
    epoch: u64,
    resources: Option<SessionResources>,
    last_error: Option<String>,
    session_id: Option<Uuid>,
}

struct Shared {
    core: Mutex<Core>,
    transcript: RwLock<Vec<TranscriptEntry>>,
    settings: RwLock<SessionSettings>,
    events: broadcast::Sender<CoachEvent>,
    metrics: Arc<PipelineMetrics>,
    entry_ids: Arc<AtomicU64>,
    backend: Arc<dyn LiveBackend>,
    capture: Arc<dyn AudioCaptureSource>,
    outputs: Arc<dyn AudioOutputFactory>,
}

/// Drives one conversation at a time.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    shared: Arc<Shared>,
}

impl ConnectionStateMachine {
    pub fn new(
        settings: SessionSettings,
        backend: Arc<dyn LiveBackend>,
        capture: Arc<dyn AudioCaptureSource>,
        outputs: Arc<dyn AudioOutputFactory>,
        metrics: Arc<PipelineMetrics>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: ConnectionState::Idle,
                    epoch: 0,
                    resources: None,
                    last_error: None,
                    session_id: None,
                }),
                transcript: RwLock::new(Vec::new()),
                settings: RwLock::new(settings),
                events,
                metrics,
                entry_ids: Arc::new(AtomicU64::new(0)),
                backend,
                capture,
                outputs,
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.shared.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.core().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.core();
        SessionSnapshot {
            state: core.state,
            last_error: core.last_error.clone(),
            session_id: core.session_id,
        }
    }

    /// Finished entries of the current (or last) conversation, in order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared
            .transcript
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoachEvent> {
        self.shared.events.subscribe()
    }

    pub fn settings(&self) -> SessionSettings {
        self.shared
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the settings used by the next `start()`.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self
            .shared
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Open a session: microphone, backend, speaker, then the data paths.
    ///
    /// ## Errors:
    /// - `AlreadyActive` if a session is Connecting or Connected (nothing is acquired)
    /// - `PermissionDenied` / `DeviceUnavailable` / `Transport` move the machine to Error
    /// - `Cancelled` if `stop()` ran while this call was waiting
    pub async fn start(&self) -> Result<SessionSnapshot, VoiceError> {
        let epoch = {
            let mut core = self.core();
            if matches!(core.state, ConnectionState::Connecting | ConnectionState::Connected) {
                return Err(VoiceError::AlreadyActive(core.state));
            }
            core.epoch += 1;
            core.state = ConnectionState::Connecting;
            core.last_error = None;
            core.session_id = None;
            core.resources = Some(SessionResources::new(Arc::clone(&self.shared.metrics)));
            self.emit_state(&core, None);
            core.epoch
        };

        self.shared
            .transcript
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.shared.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);

        let settings = self.settings();
        info!("Starting coaching session (model {})", settings.model_id);

        // Microphone first: never talk to the backend without an input
        let CaptureStream { handle, frames } = match self.shared.capture.acquire(&settings.capture).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(epoch, e)),
        };
        info!("Capture acquired from {} source", self.shared.capture.name());
        self.attach(epoch, move |resources| resources.capture = Some(handle))?;

        let LiveConnection { session, inbound } =
            match self.shared.backend.connect(&settings.model_id, &settings.connect).await {
                Ok(connection) => connection,
                Err(e) => return Err(self.fail(epoch, e)),
            };
        let session_id = session.id();
        let closer = session.clone();
        if let Err(e) = self.attach(epoch, {
            let session = session.clone();
            move |resources| resources.session = Some(session)
        }) {
            closer.close();
            return Err(e);
        }

        let output = match self.shared.outputs.open(settings.output_sample_rate).await {
            Ok(output) => output,
            Err(e) => return Err(self.fail(epoch, e)),
        };

        let mut core = self.core();
        if core.epoch != epoch || core.resources.is_none() {
            drop(core);
            if let Err(e) = output.close() {
                warn!("Closing output of a cancelled start failed: {}", e);
            }
            return Err(VoiceError::Cancelled);
        }

        let playback = Arc::new(Mutex::new(PlaybackScheduler::new(Arc::clone(&output))));
        let downlink = Downlink {
            epoch,
            machine: self.clone(),
            playback: Arc::clone(&playback),
            assembler: TranscriptAssembler::new(Arc::clone(&self.shared.entry_ids)),
            metrics: Arc::clone(&self.shared.metrics),
        };

        if let Some(resources) = core.resources.as_mut() {
            resources.output = Some(output);
            resources.playback = Some(playback);
            resources.uplink = Some(tokio::spawn(run_uplink(
                frames,
                session,
                Arc::clone(&self.shared.metrics),
            )));
            resources.downlink = Some(tokio::spawn(downlink.run(inbound)));
        }

        core.state = ConnectionState::Connected;
        core.session_id = Some(session_id);
        self.emit_state(&core, None);
        info!("Coaching session {} connected", session_id);

        Ok(SessionSnapshot {
            state: core.state,
            last_error: None,
            session_id: core.session_id,
        })
    }

    /// End the conversation from any state. Always leaves the machine Idle with no
    /// recorded error.
    pub fn stop(&self) -> SessionSnapshot {
        let mut core = self.core();
        core.epoch += 1;
        let previous = core.state;

        if let Some(mut resources) = core.resources.take() {
            let report = resources.teardown();
            if !report.is_clean() {
                warn!("Teardown finished with {} failed step(s)", report.failures.len());
            }
        }

        core.state = ConnectionState::Idle;
        core.session_id = None;
        core.last_error = None;
        if previous != ConnectionState::Idle {
            info!("Session stopped ({} -> idle)", previous);
            self.emit_state(&core, None);
        }

        SessionSnapshot {
            state: core.state,
            last_error: None,
            session_id: None,
        }
    }

    /// The live session ended on its own: cleanly (`None`) or with an error.
    ///
    /// Ignored unless `epoch` is the current, connected session.
    pub(crate) fn finish(&self, epoch: u64, error: Option<String>) {
        let mut core = self.core();
        if core.epoch != epoch || core.state != ConnectionState::Connected {
            return;
        }
        core.epoch += 1;
        if let Some(mut resources) = core.resources.take() {
            resources.teardown();
        }

        core.session_id = None;
        core.state = match &error {
            Some(reason) => {
                warn!("Session failed: {}", reason);
                ConnectionState::Error
            }
            None => {
                info!("Backend closed the session");
                ConnectionState::Idle
            }
        };
        core.last_error = error.clone();
        self.emit_state(&core, error);
    }

    /// Record finished transcript entries of the current session.
    pub(crate) fn publish_entries(&self, epoch: u64, entries: Vec<TranscriptEntry>) {
        if entries.is_empty() || self.core().epoch != epoch {
            return;
        }
        let mut transcript = self
            .shared
            .transcript
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for entry in entries {
            self.shared.metrics.transcript_entries.fetch_add(1, Ordering::Relaxed);
            transcript.push(entry.clone());
            let _ = self.shared.events.send(CoachEvent::TranscriptEntry(entry));
        }
    }

    /// Hand a freshly acquired piece to the aggregate, unless this start was cancelled.
    ///
    /// On cancellation `put` is dropped unrun, so the piece is released by its own `Drop`.
    fn attach<F>(&self, epoch: u64, put: F) -> Result<(), VoiceError>
    where
        F: FnOnce(&mut SessionResources),
    {
        let mut core = self.core();
        if core.epoch != epoch {
            drop(core);
            info!("Start overtaken by stop, releasing acquired resources");
            return Err(VoiceError::Cancelled);
        }
        match core.resources.as_mut() {
            Some(resources) => {
                put(resources);
                Ok(())
            }
            None => Err(VoiceError::Cancelled),
        }
    }

    /// A step of `start()` failed: tear down and move to Error.
    fn fail(&self, epoch: u64, err: VoiceError) -> VoiceError {
        let mut core = self.core();
        if core.epoch != epoch {
            return VoiceError::Cancelled;
        }
        core.epoch += 1;
        if let Some(mut resources) = core.resources.take() {
            resources.teardown();
        }
        warn!("Session start failed: {}", err);
        core.state = ConnectionState::Error;
        core.session_id = None;
        core.last_error = Some(err.to_string());
        self.emit_state(&core, Some(err.to_string()));
        err
    }

    fn emit_state(&self, core: &Core, reason: Option<String>) {
        // No subscribers is fine
        let _ = self.shared.events.send(CoachEvent::StateChanged {
            state: core.state,
            reason,
            session_id: core.session_id,
        });
    }
}
