//! # Backend Wire Format
//!
//! JSON frames exchanged with the live backend over the WebSocket.
//!
//! ## Client → Server:
//! - `{"setup": {...}}` once, right after the socket opens
//! - `{"realtimeInput": {"mediaChunks": [{"mimeType", "data"}]}}` per audio chunk
//!
//! ## Server → Client:
//! - `{"setupComplete": {}}` - the session is ready
//! - `{"serverContent": {...}}` - audio, transcription and turn signals, demultiplexed
//!   into `ServerMessage` values by `parse_server_frame`
//! - anything else (usage metadata, go-away notices, ...) is ignored

use crate::audio::encoder::EncodedMediaChunk;
use crate::transport::{LiveConnectConfig, ResponseModality, ServerMessage};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupFrame {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`; its presence is the flag.
#[derive(Debug, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputFrame<'a> {
    pub realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput<'a> {
    pub media_chunks: [&'a EncodedMediaChunk; 1],
}

/// Build the opening frame for `model_id`.
pub fn setup_frame(model_id: &str, config: &LiveConnectConfig) -> SetupFrame {
    let model = if model_id.starts_with("models/") {
        model_id.to_string()
    } else {
        format!("models/{}", model_id)
    };

    SetupFrame {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            },
            input_audio_transcription: config.input_transcription.then(Empty::default),
            output_audio_transcription: config.output_transcription.then(Empty::default),
        },
    }
}

pub fn realtime_input_json(chunk: &EncodedMediaChunk) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RealtimeInputFrame {
        realtime_input: RealtimeInput { media_chunks: [chunk] },
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// What one inbound frame means.
#[derive(Debug, PartialEq)]
pub enum ParsedFrame {
    SetupComplete,
    Messages(Vec<ServerMessage>),
    Ignored,
}

/// Parse one inbound JSON frame.
///
/// ## Demultiplexing order within a `serverContent` frame:
/// 1. `Interrupted` (so stale audio is flushed before anything new is scheduled)
/// 2. user transcription, then model transcription
/// 3. one `AudioChunk` per inline audio part, in part order
/// 4. `TurnComplete` (after the fragments it closes)
///
/// Parts whose base64 can't be decoded are logged and skipped.
pub fn parse_server_frame(text: &str) -> Result<ParsedFrame, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(text)?;

    if frame.setup_complete.is_some() {
        return Ok(ParsedFrame::SetupComplete);
    }
    let content = match frame.server_content {
        Some(content) => content,
        None => return Ok(ParsedFrame::Ignored),
    };

    let mut messages = Vec::new();
    if content.interrupted {
        messages.push(ServerMessage::Interrupted);
    }
    if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
        messages.push(ServerMessage::InputTranscriptFragment(t.text));
    }
    if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
        messages.push(ServerMessage::OutputTranscriptFragment(t.text));
    }

    let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
    for inline in parts.into_iter().filter_map(|part| part.inline_data) {
        if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
            continue;
        }
        match STANDARD.decode(inline.data.as_bytes()) {
            Ok(bytes) => messages.push(ServerMessage::AudioChunk(bytes)),
            Err(e) => warn!("Skipping audio part with bad base64: {}", e),
        }
    }

    if content.turn_complete {
        messages.push(ServerMessage::TurnComplete);
    }

    Ok(ParsedFrame::Messages(messages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::pcm_mime_type;
    use serde_json::json;

    fn connect_config() -> LiveConnectConfig {
        LiveConnectConfig {
            response_modality: ResponseModality::Audio,
            voice_name: "Puck".to_string(),
            system_instruction: "You are a patient coach.".to_string(),
            input_transcription: true,
            output_transcription: true,
        }
    }

    #[test]
    fn test_setup_frame_shape() {
        let frame = setup_frame("gemini-live", &connect_config());
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["setup"]["model"], "models/gemini-live");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(value["setup"]["systemInstruction"]["parts"][0]["text"], "You are a patient coach.");
        assert_eq!(value["setup"]["inputAudioTranscription"], json!({}));
        assert_eq!(value["setup"]["outputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_transcription_flags_can_be_omitted() {
        let mut config = connect_config();
        config.output_transcription = false;
        let value = serde_json::to_value(setup_frame("models/x", &config)).unwrap();

        assert_eq!(value["setup"]["model"], "models/x");
        assert!(value["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn test_realtime_input_frame() {
        let chunk = EncodedMediaChunk {
            mime_type: pcm_mime_type(16_000),
            data: "AAA=".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&realtime_input_json(&chunk).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAA="}]}})
        );
    }

    #[test]
    fn test_setup_complete() {
        assert_eq!(parse_server_frame(r#"{"setupComplete":{}}"#).unwrap(), ParsedFrame::SetupComplete);
    }

    #[test]
    fn test_server_content_demux_order() {
        let audio = STANDARD.encode([1u8, 0, 2, 0]);
        let frame = json!({
            "serverContent": {
                "turnComplete": true,
                "interrupted": true,
                "outputTranscription": {"text": " there"},
                "inputTranscription": {"text": "hi"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": audio}},
                    {"text": "ignored"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "!!!"}}
                ]}
            }
        });

        let parsed = parse_server_frame(&frame.to_string()).unwrap();
        assert_eq!(
            parsed,
            ParsedFrame::Messages(vec![
                ServerMessage::Interrupted,
                ServerMessage::InputTranscriptFragment("hi".to_string()),
                ServerMessage::OutputTranscriptFragment(" there".to_string()),
                ServerMessage::AudioChunk(vec![1, 0, 2, 0]),
                ServerMessage::TurnComplete,
            ])
        );
    }

    #[test]
    fn test_unknown_frames_are_ignored() {
        assert_eq!(parse_server_frame(r#"{"usageMetadata":{"totalTokenCount":3}}"#).unwrap(), ParsedFrame::Ignored);
        assert!(parse_server_frame("not json").is_err());
    }
}
