//! Realtime voice transport to the remote model
//!
//! One persistent WebSocket session per call, driven by an explicit state
//! machine so that capture, network and teardown callbacks can interleave
//! in any order without corrupting the session.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────────┐
//!  ClientMessage ──────▶│ writer task ──▶ WS sink  │
//!                       │                          │──▶ remote model
//!  ServerEvent  ◀───────│ reader task ◀── WS read  │
//!                       └──────────────────────────┘
//!                              LiveLink
//!                                 ▲
//!                     TransportSession (state machine)
//! ```
//!
//! No reconnection: a dropped session ends the call.

mod client;
mod protocol;
mod session;

pub use client::{GeminiLiveConnector, LiveConnector, LiveLink};
pub use protocol::{
    parse_server_events, ClientMessage, ServerEvent, ServerMessage, LIVE_API_URL,
};
pub use session::{
    reduce, CloseInfo, HandshakeResult, TransportEffect, TransportEvent, TransportSession,
    TransportState,
};

/// Default realtime voice model
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE_NAME: &str = "Kore";

/// Microphone audio sent to the model
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Model audio received for playback
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Errors that can occur on the voice transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    /// No API key configured
    #[error("API key not configured. Set GEMINI_API_KEY or run `steadycoach config set --api-key`.")]
    MissingApiKey,
    /// Failed to establish the WebSocket session
    #[error("Failed to connect to the voice service: {0}")]
    ConnectionFailed(String),
    /// The credential was rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Malformed or unexpected traffic
    #[error("Voice protocol error: {0}")]
    ProtocolError(String),
    /// The connection closed unexpectedly
    #[error("Voice connection closed: {0}")]
    Disconnected(String),
    /// An outbound message could not be queued
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
    /// Operation not valid in the current session state
    #[error("Invalid transport state: {0}")]
    InvalidState(String),
}

/// Immutable per-connection configuration
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

impl SessionConfig {
    pub fn new(api_key: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE_NAME.to_string(),
            system_instruction: system_instruction.into(),
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

// Keeps the credential out of logs
impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("voice_name", &self.voice_name)
            .field("system_instruction_len", &self.system_instruction.len())
            .field("input_sample_rate", &self.input_sample_rate)
            .field("output_sample_rate", &self.output_sample_rate)
            .finish()
    }
}
