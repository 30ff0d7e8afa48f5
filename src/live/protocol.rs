//! Gemini Live (BidiGenerateContent) protocol types
//!
//! JSON messages exchanged with the realtime voice model over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the BidiGenerateContent endpoint with `?key=<api key>`
//! 2. Send `setup` with model, voice and system instruction
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` carrying audio parts, transcriptions,
//!    `interrupted` and `turnComplete` flags

use serde::{Deserialize, Serialize};

use super::SessionConfig;
use crate::audio::MediaBlob;

/// Gemini Live endpoint (the API key is appended as a query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

// ============================================================================
// Client Messages (sent TO the model)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message of every session
    Setup(Setup),

    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup message for a session
    pub fn setup(config: &SessionConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        let system_instruction = if config.system_instruction.trim().is_empty() {
            None
        } else {
            Some(Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            })
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                }),
            },
            system_instruction,
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        })
    }

    /// Wrap one encoded microphone frame
    pub fn audio(blob: MediaBlob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![blob],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Present (as `{}`) to request transcription of microphone audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    /// Present (as `{}`) to request transcription of model audio
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

// ============================================================================
// Server Messages (received FROM the model)
// ============================================================================

/// One inbound JSON message. Every field is optional; unknown fields
/// (tool calls, usage metadata) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<InboundPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<MediaBlob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Inbound events in the order the controller must react to them.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Handshake acknowledged
    SetupComplete,
    /// Recognised microphone speech (delta)
    InputTranscript(String),
    /// One chunk of model audio
    AudioChunk(MediaBlob),
    /// Transcription of the model's speech (delta)
    OutputTranscript(String),
    /// The user barged in; queued model audio must stop
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The server will close the connection soon
    GoAway { time_left: Option<String> },
    /// Transport error reported mid-call
    Error(String),
    /// The connection closed
    Closed { code: Option<u16>, reason: String },
}

impl ServerMessage {
    /// Expand into events, preserving the order within the message
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(t) = content.input_transcription {
                if !t.text.is_empty() {
                    events.push(ServerEvent::InputTranscript(t.text));
                }
            }

            if let Some(turn) = content.model_turn {
                events.extend(
                    turn.parts
                        .into_iter()
                        .filter_map(|part| part.inline_data)
                        .filter(|blob| !blob.data.is_empty())
                        .map(ServerEvent::AudioChunk),
                );
            }

            if let Some(t) = content.output_transcription {
                if !t.text.is_empty() {
                    events.push(ServerEvent::OutputTranscript(t.text));
                }
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

/// Parse one text or binary frame payload into events
pub fn parse_server_events(payload: &[u8]) -> Result<Vec<ServerEvent>, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(payload)?;
    Ok(message.into_events())
}
