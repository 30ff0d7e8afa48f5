//! PCM16 codec helpers for the realtime voice transport
//!
//! Pure conversions between microphone samples, the base64 PCM16 payloads
//! carried by the voice protocol, and decoded buffers ready for playback.
//!
//! # Wire format
//!
//! - 16-bit signed little-endian PCM, interleaved when multi-channel
//! - Base64 (standard alphabet, padded) inside a JSON envelope
//! - MIME descriptor `audio/pcm;rate=<hz>`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Bytes per PCM16 sample
const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced while decoding inbound audio.
///
/// A decode failure concerns a single chunk; callers skip the chunk and keep
/// the call running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    InvalidBase64(String),
    #[error("PCM16 payload of {len} bytes is not aligned to {frame_bytes}-byte frames")]
    Misaligned { len: usize, frame_bytes: usize },
    #[error("audio payload is empty")]
    Empty,
    #[error("channel count must be at least 1")]
    InvalidChannelCount,
}

/// Encoded audio tagged with its MIME descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

impl MediaBlob {
    /// Sample rate declared in the MIME descriptor, if any
    pub fn sample_rate(&self) -> Option<u32> {
        parse_pcm_rate(&self.mime_type)
    }
}

/// A decoded, ready-to-play audio buffer (planar channels).
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    /// Build a mono buffer from samples in [-1, 1]
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(|c| c.as_slice())
    }

    /// Number of sample frames per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at a fractional frame position, linearly interpolated.
    /// Returns `None` once the position is past the end of the buffer.
    pub fn sample_at(&self, channel: usize, position: f64) -> Option<f32> {
        let data = self.channels.get(channel.min(self.channels.len().saturating_sub(1)))?;
        if position < 0.0 {
            return Some(0.0);
        }
        let index = position.floor() as usize;
        let a = *data.get(index)?;
        let b = data.get(index + 1).copied().unwrap_or(a);
        let frac = (position - index as f64) as f32;
        Some(a + (b - a) * frac)
    }
}

/// Convert a float sample in [-1, 1] to PCM16, clamping out-of-range input.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).round() as i16
}

/// Convert a PCM16 sample to a float in [-1, 1).
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| float_to_pcm16(s).to_le_bytes())
        .collect()
}

/// Encode float samples into the transport envelope.
pub fn encode_media_blob(samples: &[f32], sample_rate: u32) -> MediaBlob {
    MediaBlob {
        mime_type: pcm_mime_type(sample_rate),
        data: bytes_to_base64(&encode_pcm16(samples)),
    }
}

/// Decode little-endian PCM16 bytes into a playable buffer.
///
/// Chunk length is arbitrary as long as it holds whole frames.
pub fn decode_pcm16(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<PlaybackBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidChannelCount);
    }
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let channel_count = channels as usize;
    let frame_bytes = BYTES_PER_SAMPLE * channel_count;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut planar = vec![Vec::with_capacity(frames); channel_count];

    for (i, pair) in bytes.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        planar[i % channel_count].push(pcm16_to_float(sample));
    }

    Ok(PlaybackBuffer {
        sample_rate,
        channels: planar,
    })
}

/// Decode a transport envelope into a playable buffer.
pub fn decode_media_blob(
    blob: &MediaBlob,
    default_rate: u32,
    channels: u16,
) -> Result<PlaybackBuffer, DecodeError> {
    let bytes = base64_to_bytes(&blob.data)?;
    let rate = blob.sample_rate().unwrap_or(default_rate);
    decode_pcm16(&bytes, rate, channels)
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn base64_to_bytes(text: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract `rate=<hz>` from a descriptor such as `audio/pcm;rate=24000`.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&rate| rate > 0)
}
