//! Audio engine for realtime voice calls
//!
//! Microphone capture with a volume tap, PCM16 codec helpers, and gapless
//! scheduled playback on the speaker. Uses CPAL for device access.

pub mod capture;
pub mod codec;
pub mod meter;
pub mod output;
pub mod playback;
pub mod resample;

pub use capture::{
    CaptureFrame, CapturePipeline, CaptureTap, CpalMicrophone, Microphone, MicrophoneStream,
    CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE,
};
pub use codec::{DecodeError, MediaBlob, PlaybackBuffer};
pub use output::{AudioOutput, CpalOutputDevice, OutputDevice, VoiceId};
pub use playback::{PlaybackScheduler, ScheduledPlayback};

/// Errors that can occur while acquiring or driving audio devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AudioError {
    #[error("Microphone access was denied")]
    PermissionDenied,
    #[error("No audio device available")]
    DeviceUnavailable,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio stream is already active")]
    AlreadyActive,
}

/// Map a backend error message onto the audio error taxonomy.
///
/// Backends report permission problems only as free-form text.
pub(crate) fn classify_backend_error(message: String) -> AudioError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted")
    {
        AudioError::PermissionDenied
    } else if lower.contains("not available") || lower.contains("no such device") {
        AudioError::DeviceUnavailable
    } else {
        AudioError::StreamCreationFailed(message)
    }
}
