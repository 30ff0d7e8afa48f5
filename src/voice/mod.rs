//! Voice session controller and its public surface
//!
//! Composes capture, transport and playback into one call with a
//! connect/disconnect lifecycle. The host observes [`VoiceStatus`] through a
//! watch channel and receives [`VoiceEvent`]s (transcripts, errors, end of
//! call) on an event channel.

mod controller;
mod metrics;

pub use controller::VoiceSessionHandle;
pub use metrics::CallStats;

use std::sync::Arc;

use crate::audio::{AudioError, CpalMicrophone, CpalOutputDevice, Microphone, OutputDevice};
use crate::live::{GeminiLiveConnector, LiveConnector, LiveError};
use crate::transcript::Role;

/// User-facing failures of a voice call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    /// Microphone access refused; the user must retry manually
    #[error("Microphone permission denied")]
    PermissionDenied,
    /// No usable audio hardware
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// Handshake or network failure
    #[error("Connection error: {0}")]
    Connection(String),
    /// The remote reported an error mid-call
    #[error("Stream error: {0}")]
    Stream(String),
    /// A call is already in progress
    #[error("A voice call is already active")]
    AlreadyActive,
    /// `disconnect()` was called before the call opened
    #[error("Connection cancelled")]
    Cancelled,
    /// The controller has stopped
    #[error("Voice controller shut down")]
    Shutdown,
}

impl From<AudioError> for VoiceError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::PermissionDenied => VoiceError::PermissionDenied,
            AudioError::AlreadyActive => VoiceError::AlreadyActive,
            other => VoiceError::DeviceUnavailable(other.to_string()),
        }
    }
}

impl From<LiveError> for VoiceError {
    fn from(err: LiveError) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

/// Coarse call lifecycle for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    Connecting,
    Live,
}

/// Observable call state, published as snapshots
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VoiceStatus {
    pub phase: CallPhase,
    pub connected: bool,
    pub ai_speaking: bool,
    /// Microphone level, 0-100
    pub volume: f32,
}

/// Events delivered to the host
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// A completed turn (one per turn)
    Transcript { role: Role, text: String },
    /// The call failed after connect() returned
    Error(VoiceError),
    /// The remote closed the call
    Closed { reason: String },
    /// Teardown finished; every resource is released
    Ended(CallStats),
}

/// The devices and connector a controller drives
#[derive(Clone)]
pub struct VoiceDevices {
    pub microphone: Arc<dyn Microphone>,
    pub output: Arc<dyn OutputDevice>,
    pub connector: Arc<dyn LiveConnector>,
}

impl VoiceDevices {
    /// Default microphone and speaker, Gemini Live transport
    pub fn system() -> Self {
        Self {
            microphone: Arc::new(CpalMicrophone::new()),
            output: Arc::new(CpalOutputDevice::new()),
            connector: Arc::new(GeminiLiveConnector::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_mapping() {
        assert_eq!(
            VoiceError::from(AudioError::PermissionDenied),
            VoiceError::PermissionDenied
        );
        assert!(matches!(
            VoiceError::from(AudioError::DeviceUnavailable),
            VoiceError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            VoiceError::from(AudioError::StreamCreationFailed("x".into())),
            VoiceError::DeviceUnavailable(ref m) if m.contains('x')
        ));
    }

    #[test]
    fn test_live_error_is_connection_error() {
        let err = VoiceError::from(LiveError::AuthenticationFailed("bad key".into()));
        assert!(matches!(err, VoiceError::Connection(ref m) if m.contains("bad key")));
    }

    #[test]
    fn test_default_status() {
        let status = VoiceStatus::default();
        assert_eq!(status.phase, CallPhase::Idle);
        assert!(!status.connected);
        assert!(!status.ai_speaking);
        assert_eq!(status.volume, 0.0);
    }
}
