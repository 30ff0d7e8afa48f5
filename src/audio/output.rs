//! Speaker output with its own monotonic clock
//!
//! The playback scheduler talks to an [`AudioOutput`]: a device that can start
//! a decoded buffer at an absolute time on the output clock, stop it early,
//! and report when a buffer has finished playing. Times are seconds since the
//! output was opened, measured in rendered frames rather than wall-clock time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::codec::PlaybackBuffer;
use super::{classify_backend_error, AudioError};

/// Identifier of one scheduled buffer on an output
pub type VoiceId = u64;

static NEXT_VOICE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique voice id
pub fn next_voice_id() -> VoiceId {
    NEXT_VOICE_ID.fetch_add(1, Ordering::Relaxed)
}

/// An open output device.
///
/// `start` schedules a buffer; when it plays to the end its id is sent on the
/// `ended` channel given to [`OutputDevice::open`]. `stop` silences a buffer
/// immediately and does not report it as ended.
pub trait AudioOutput: Send {
    /// Seconds on the output clock
    fn current_time(&self) -> f64;
    fn start(&mut self, id: VoiceId, buffer: Arc<PlaybackBuffer>, start_at: f64);
    fn stop(&mut self, id: VoiceId);
    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Factory for output devices at a requested sample rate.
pub trait OutputDevice: Send + Sync {
    fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError>;
}

struct Voice {
    id: VoiceId,
    buffer: Arc<PlaybackBuffer>,
    /// Absolute device frame at which the buffer starts
    start_frame: f64,
    /// Set once the first sample has been rendered
    playing: bool,
    /// Buffer frames advanced per device frame
    step: f64,
}

/// Voices currently scheduled on a device, mixed on the audio thread.
struct Mixer {
    voices: Vec<Voice>,
    channels: usize,
    ended: mpsc::UnboundedSender<VoiceId>,
}

impl Mixer {
    /// Render one interleaved block beginning at absolute frame `first_frame`
    fn render(&mut self, out: &mut [f32], first_frame: u64) {
        out.fill(0.0);
        if self.voices.is_empty() || self.channels == 0 {
            return;
        }

        let frames = out.len() / self.channels;
        let mut finished: Vec<VoiceId> = Vec::new();

        for voice in &mut self.voices {
            // A start time that is already past plays from the first sample
            if !voice.playing && voice.start_frame < first_frame as f64 {
                voice.start_frame = first_frame as f64;
            }
            let mut done = false;
            for frame in 0..frames {
                let absolute = (first_frame + frame as u64) as f64;
                if absolute < voice.start_frame {
                    continue;
                }
                voice.playing = true;
                let position = (absolute - voice.start_frame) * voice.step;
                let base = frame * self.channels;
                let mut ran_out = false;
                for ch in 0..self.channels {
                    match voice.buffer.sample_at(ch, position) {
                        Some(sample) => out[base + ch] += sample,
                        None => ran_out = true,
                    }
                }
                if ran_out {
                    done = true;
                    break;
                }
            }
            if done {
                finished.push(voice.id);
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        if !finished.is_empty() {
            self.voices.retain(|v| !finished.contains(&v.id));
            for id in finished {
                let _ = self.ended.send(id);
            }
        }
    }
}

/// Default output device via CPAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutputDevice;

impl CpalOutputDevice {
    pub fn new() -> Self {
        Self
    }
}

impl OutputDevice for CpalOutputDevice {
    fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<VoiceId>,
    ) -> Result<Box<dyn AudioOutput>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(u32, usize), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let mixer = Arc::new(Mutex::new(Mixer {
            voices: Vec::new(),
            channels: 0,
            ended,
        }));

        let thread_mixer = mixer.clone();
        let thread_clock = frames_rendered.clone();
        let thread = std::thread::Builder::new()
            .name("steadycoach-playback".into())
            .spawn(move || {
                match build_output_stream(sample_rate, thread_mixer, thread_clock) {
                    Ok((stream, device_rate, channels)) => {
                        let _ = ready_tx.send(Ok((device_rate, channels)));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let ready = ready_rx.recv().map_err(|_| {
            AudioError::StreamCreationFailed("playback thread exited during setup".into())
        });

        match ready {
            Ok(Ok((device_rate, channels))) => {
                log::info!(
                    "Playback: output open ({} Hz device, {} channels)",
                    device_rate,
                    channels
                );
                Ok(Box::new(CpalOutput {
                    mixer,
                    frames_rendered,
                    device_rate,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }))
            }
            Ok(Err(e)) | Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }
}

struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
    device_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn start(&mut self, id: VoiceId, buffer: Arc<PlaybackBuffer>, start_at: f64) {
        let step = buffer.sample_rate() as f64 / self.device_rate as f64;
        let voice = Voice {
            id,
            buffer,
            start_frame: start_at * self.device_rate as f64,
            playing: false,
            step,
        };
        match self.mixer.lock() {
            Ok(mut mixer) => mixer.voices.push(voice),
            Err(poisoned) => poisoned.into_inner().voices.push(voice),
        }
    }

    fn stop(&mut self, id: VoiceId) {
        match self.mixer.lock() {
            Ok(mut mixer) => mixer.voices.retain(|v| v.id != id),
            Err(poisoned) => poisoned.into_inner().voices.retain(|v| v.id != id),
        }
    }

    fn close(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Playback: stream thread panicked");
            }
            log::info!("Playback: output closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
) -> Result<(cpal::Stream, u32, usize), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::DeviceUnavailable)?;

    log::info!("Playback: using output device {:?}", device.name());

    let (config, sample_format) = output_config(&device, sample_rate)?;
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;

    if let Ok(mut m) = mixer.lock() {
        m.channels = channels;
    }

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, mixer, frames_rendered),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, mixer, frames_rendered),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, mixer, frames_rendered),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok((stream, device_rate, channels))
}

/// Prefer the stream's native rate; otherwise use the device default and
/// let the mixer resample.
fn output_config(
    device: &Device,
    sample_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(sample_rate);

    if let Ok(mut configs) = device.supported_output_configs() {
        let native = configs.find(|c| {
            c.min_sample_rate() <= target
                && c.max_sample_rate() >= target
                && matches!(
                    c.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
        });
        if let Some(range) = native {
            let supported = range.with_sample_rate(target);
            let format = supported.sample_format();
            return Ok((supported.into(), format));
        }
    }

    let supported = device.default_output_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AudioError::DeviceUnavailable,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => AudioError::NoSupportedConfig,
        other => classify_backend_error(other.to_string()),
    })?;
    let format = supported.sample_format();
    Ok((supported.into(), format))
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    frames_rendered: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = (config.channels as usize).max(1);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                let first_frame = frames_rendered.load(Ordering::Acquire);

                match mixer.lock() {
                    Ok(mut m) => m.render(&mut scratch, first_frame),
                    Err(poisoned) => poisoned.into_inner().render(&mut scratch, first_frame),
                }

                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }

                frames_rendered.fetch_add((data.len() / channels) as u64, Ordering::Release);
            },
            |err| log::error!("Playback: stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceUnavailable,
            cpal::BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
            other => classify_backend_error(other.to_string()),
        })
}
