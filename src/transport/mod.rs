//! # Live Session Transport
//!
//! A live session is a long-lived, bidirectional connection to the conversational
//! backend: encoded microphone audio goes out, synthesized audio, transcription
//! fragments and control signals come back.
//!
//! ## Key Components:
//! - **LiveBackend**: Opens sessions (`connect`), resolving once the backend is ready
//! - **LiveSession**: Cloneable send/close handle; sending never blocks
//! - **ServerMessage**: Everything the backend can push, as one exhaustive enum
//! - **wire**: JSON frame format of the WebSocket backend
//! - **ws_client**: `LiveBackend` over a WebSocket connection

pub mod wire;       // JSON frames exchanged with the backend
pub mod ws_client;  // tokio-tungstenite implementation

use crate::audio::encoder::EncodedMediaChunk;
use crate::error::VoiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One message pushed by the backend.
///
/// Audio, transcription and control messages can interleave freely within a turn;
/// consumers handle them in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Raw little-endian PCM16 at the output rate
    AudioChunk(Vec<u8>),
    /// Transcription of what the user said
    InputTranscriptFragment(String),
    /// Transcription of what the model said
    OutputTranscriptFragment(String),
    TurnComplete,
    /// The user barged in; drop whatever is still queued for playback
    Interrupted,
    /// The backend closed the session
    Closed,
    Error(String),
}

/// What the model should answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Audio,
    Text,
}

/// Everything the backend needs to know when a session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConnectConfig {
    pub response_modality: ResponseModality,
    pub voice_name: String,
    /// System instruction with the persona already filled in
    pub system_instruction: String,
    /// Ask the backend to transcribe the user's audio
    pub input_transcription: bool,
    /// Ask the backend to transcribe its own audio
    pub output_transcription: bool,
}

/// Queued for the connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Media(EncodedMediaChunk),
    Close,
}

/// Handle to an open session.
///
/// ## Semantics:
/// - `send` enqueues without waiting; chunks leave in call order
/// - After `close` (or after the backend closed), `send` is a silent no-op returning `false`
/// - `close` is idempotent; only the first call reaches the wire
#[derive(Debug, Clone)]
pub struct LiveSession {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl LiveSession {
    /// A session handle plus the queue its writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Self {
            id: Uuid::new_v4(),
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enqueue one chunk. Returns `false` if the session is already closed.
    pub fn send(&self, chunk: EncodedMediaChunk) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(Outbound::Media(chunk)).is_ok()
    }

    /// Close the session. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The writer may already be gone; nothing left to tell it then
        let _ = self.outbound.send(Outbound::Close);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// Record that the remote side ended the session.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// An open session and the messages it receives.
pub struct LiveConnection {
    pub session: LiveSession,
    pub inbound: mpsc::Receiver<ServerMessage>,
}

/// A conversational backend that can open live sessions.
///
/// `connect` resolves once the backend has acknowledged the setup (the session is
/// "open") and fails if it can't get there.
#[async_trait]
pub trait LiveBackend: Send + Sync {
    async fn connect(&self, model_id: &str, config: &LiveConnectConfig) -> Result<LiveConnection, VoiceError>;
}
