//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - An optional `config.toml` file
//! - Environment variables (with `APP_` prefix, sections separated by `__`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_BACKEND__MODEL_ID`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Rust Concepts:
//! - **Serde enums**: `capture = "file"` in TOML becomes `CaptureKind::File`
//! - **cfg!(feature = ...)**: Validation knows at compile time whether device audio exists

use crate::audio::capture::CaptureConfig;
use crate::coach::SessionSettings;
use crate::transport::{LiveConnectConfig, ResponseModality};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Placeholder in `instruction_template` that the persona replaces.
pub const PERSONA_PLACEHOLDER: &str = "{persona}";

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub coach: CoachConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The streaming conversational backend.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL (`wss://` needs the `tls` feature)
/// - `model_id`: Sent in the setup frame as `models/<model_id>`
/// - `voice_name`: Prebuilt voice the model answers with
/// - `connect_timeout_secs`: How long `start()` waits for the session to become ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    pub model_id: String,
    pub voice_name: String,
    pub connect_timeout_secs: u64,
}

/// Who the coach is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachConfig {
    pub persona: String,
    /// System instruction text; must contain `{persona}`
    pub instruction_template: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Replay a WAV file as if it were a microphone
    File,
    /// Default input device (needs the `device-audio` feature)
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Software clock, audio is mixed and discarded
    Headless,
    /// Default output device (needs the `device-audio` feature)
    Device,
}

/// Audio formats and endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// Samples per uplink frame
    pub frame_size: usize,
    pub capture: CaptureKind,
    pub capture_file: String,
    pub output: OutputKind,
    /// Frames buffered between the capture callback and the uplink
    pub capture_queue_frames: usize,
}

/// Queue sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub inbound_queue_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            backend: BackendConfig {
                endpoint: "ws://127.0.0.1:9000/live".to_string(),
                model_id: "gemini-2.0-flash-live-001".to_string(),
                voice_name: "Puck".to_string(),
                connect_timeout_secs: 10,
            },
            coach: CoachConfig {
                persona: "a friendly, encouraging speaking coach".to_string(),
                instruction_template: "You are {persona}. Keep answers short and conversational, \
                                       and ask one follow-up question at a time."
                    .to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: crate::audio::INPUT_SAMPLE_RATE,
                output_sample_rate: crate::audio::OUTPUT_SAMPLE_RATE,
                frame_size: crate::audio::DEFAULT_FRAME_SIZE,
                capture: CaptureKind::File,
                capture_file: "audio/coach-input.wav".to_string(),
                output: OutputKind::Headless,
                capture_queue_frames: 32,
            },
            performance: PerformanceConfig {
                inbound_queue_capacity: 256,
                event_channel_capacity: 128,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_BACKEND__ENDPOINT=wss://example.com/live`
    /// - `APP_AUDIO__CAPTURE=device`
    /// - `HOST=0.0.0.0`, `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration can actually run a session.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.backend.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend endpoint cannot be empty"));
        }
        if self.backend.model_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend model_id cannot be empty"));
        }
        if self.backend.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Backend connect timeout must be greater than 0"));
        }

        if !self.coach.instruction_template.contains(PERSONA_PLACEHOLDER) {
            return Err(anyhow::anyhow!(
                "Instruction template must contain the {} placeholder",
                PERSONA_PLACEHOLDER
            ));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }
        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }
        if self.audio.capture_queue_frames == 0 {
            return Err(anyhow::anyhow!("Capture queue must hold at least one frame"));
        }
        if self.audio.capture == CaptureKind::File && self.audio.capture_file.trim().is_empty() {
            return Err(anyhow::anyhow!("File capture needs audio.capture_file"));
        }

        let wants_device = self.audio.capture == CaptureKind::Device || self.audio.output == OutputKind::Device;
        if wants_device && !cfg!(feature = "device-audio") {
            return Err(anyhow::anyhow!(
                "Device audio requested but this build lacks the device-audio feature"
            ));
        }

        if self.performance.inbound_queue_capacity == 0 || self.performance.event_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacities must be greater than 0"));
        }

        Ok(())
    }

    /// The persona substituted into the instruction template.
    pub fn system_instruction(&self) -> String {
        self.coach
            .instruction_template
            .replace(PERSONA_PLACEHOLDER, self.coach.persona.trim())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.connect_timeout_secs)
    }

    /// What the coach needs for its next `start()`.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            model_id: self.backend.model_id.clone(),
            connect: LiveConnectConfig {
                response_modality: ResponseModality::Audio,
                voice_name: self.backend.voice_name.clone(),
                system_instruction: self.system_instruction(),
                input_transcription: true,
                output_transcription: true,
            },
            capture: CaptureConfig {
                sample_rate: self.audio.input_sample_rate,
                frame_size: self.audio.frame_size,
                queue_frames: self.audio.capture_queue_frames,
            },
            output_sample_rate: self.audio.output_sample_rate,
        }
    }

    /// Apply a partial update, e.g. `{"coach": {"persona": "a debate coach"}}`.
    ///
    /// Only the fields that are present change. The backend endpoint, its connect timeout,
    /// audio endpoints and the server address are fixed at startup; updating them is an error.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(backend) = partial_config.get("backend") {
            for key in ["endpoint", "connect_timeout_secs"] {
                if backend.get(key).is_some() {
                    return Err(anyhow::anyhow!("backend.{} is fixed at startup", key));
                }
            }
            if let Some(model_id) = backend.get("model_id").and_then(|v| v.as_str()) {
                self.backend.model_id = model_id.to_string();
            }
            if let Some(voice) = backend.get("voice_name").and_then(|v| v.as_str()) {
                self.backend.voice_name = voice.to_string();
            }
        }

        if let Some(coach) = partial_config.get("coach") {
            if let Some(persona) = coach.get("persona").and_then(|v| v.as_str()) {
                self.coach.persona = persona.to_string();
            }
            if let Some(template) = coach.get("instruction_template").and_then(|v| v.as_str()) {
                self.coach.instruction_template = template.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = frame_size as usize;
            }
            if let Some(queue) = audio.get("capture_queue_frames").and_then(|v| v.as_u64()) {
                self.audio.capture_queue_frames = queue as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
