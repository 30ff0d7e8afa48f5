//! Microphone capture pipeline
//!
//! Acquires the microphone and fans the stream out to two consumers: the
//! volume meter and a fixed-size frame emitter feeding the voice transport.
//!
//! # Architecture
//!
//! ```text
//! Audio Thread (sync)                          Tokio Runtime (async)
//! ┌──────────────────────────────┐            ┌────────────────────┐
//! │ CPAL Callback                │            │ Voice controller   │
//! │  └─ CaptureTap::process      │            │   ├─ encode        │
//! │      ├─ mix + resample 16k   │            │   └─ send          │
//! │      ├─ meter (try_lock)     │            └────────────────────┘
//! │      └─ frame 4096 ─try_send─┼──channel──▶
//! └──────────────────────────────┘
//! ```
//!
//! Nothing on the audio thread blocks: the meter is skipped when the UI holds
//! its lock and frames are dropped (and counted) when the channel is full.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::meter::VolumeMeter;
use super::resample::{mix_to_mono, LinearResampler};
use super::{classify_backend_error, AudioError};

/// Samples per emitted frame (4096 at 16kHz = 256ms)
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Sample rate of emitted frames
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Frames buffered between the audio thread and the controller (~8s)
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Log a drop warning once per this many dropped frames
const DROP_LOG_INTERVAL: u64 = 50;

/// One fixed-size block of mono samples at the capture rate.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    pub sequence: u64,
    pub samples: Vec<f32>,
}

/// Source of microphone audio.
///
/// `open` acquires the device exclusively and feeds every hardware buffer to
/// the tap until the returned stream is closed or dropped.
pub trait Microphone: Send + Sync {
    fn open(&self, tap: CaptureTap) -> Result<Box<dyn MicrophoneStream>, AudioError>;
}

/// A live microphone stream. Closing (or dropping) releases the device.
pub trait MicrophoneStream: Send {
    fn close(&mut self);
}

/// Fan-out node run on the audio thread for every hardware buffer.
pub struct CaptureTap {
    target_rate: u32,
    frame_samples: usize,
    resampler: Option<LinearResampler>,
    meter: Arc<Mutex<VolumeMeter>>,
    emitting: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<CaptureFrame>,
    dropped: Arc<AtomicU64>,
    pending: Vec<f32>,
    resampled: Vec<f32>,
    sequence: u64,
}

impl CaptureTap {
    /// Feed interleaved device samples
    pub fn process_interleaved(&mut self, data: &[f32], channels: usize, source_rate: u32) {
        if channels <= 1 {
            self.process(data, source_rate);
        } else {
            let mono = mix_to_mono(data, channels);
            self.process(&mono, source_rate);
        }
    }

    /// Feed mono samples recorded at `source_rate`
    pub fn process(&mut self, samples: &[f32], source_rate: u32) {
        if samples.is_empty() {
            return;
        }

        if self.resampler.as_ref().map(|r| r.source_rate()) != Some(source_rate) {
            self.resampler = Some(LinearResampler::new(source_rate, self.target_rate));
        }
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };

        self.resampled.clear();
        resampler.process(samples, &mut self.resampled);

        // Volume tap: skipped rather than waiting on a reader
        if let Ok(mut meter) = self.meter.try_lock() {
            meter.push_samples(&self.resampled);
        }

        if !self.emitting.load(Ordering::Acquire) {
            self.pending.clear();
            return;
        }

        self.pending.extend_from_slice(&self.resampled);
        while self.pending.len() >= self.frame_samples {
            let samples: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            let frame = CaptureFrame {
                sequence: self.sequence,
                samples,
            };
            self.sequence += 1;

            if self.frames_tx.try_send(frame).is_err() {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_INTERVAL == 0 {
                    log::warn!("Capture: frame channel full, {} frames dropped", dropped);
                }
            }
        }
    }
}

/// Owns the microphone for the duration of a call.
pub struct CapturePipeline {
    microphone: Arc<dyn Microphone>,
    stream: Option<Box<dyn MicrophoneStream>>,
    meter: Arc<Mutex<VolumeMeter>>,
    emitting: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    target_rate: u32,
    frame_samples: usize,
}

impl CapturePipeline {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            stream: None,
            meter: Arc::new(Mutex::new(VolumeMeter::new())),
            emitting: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            target_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }

    /// Override the emitted frame format
    pub fn with_format(mut self, target_rate: u32, frame_samples: usize) -> Self {
        self.target_rate = target_rate;
        self.frame_samples = frame_samples.max(1);
        self
    }

    /// Acquire the microphone and start tapping it.
    ///
    /// Frames are only emitted once the emit gate is opened with
    /// [`set_emitting`](Self::set_emitting); the meter runs immediately.
    pub fn start(&mut self) -> Result<mpsc::Receiver<CaptureFrame>, AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::AlreadyActive);
        }

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        self.emitting.store(false, Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
        if let Ok(mut meter) = self.meter.lock() {
            meter.reset();
        }

        let tap = CaptureTap {
            target_rate: self.target_rate,
            frame_samples: self.frame_samples,
            resampler: None,
            meter: self.meter.clone(),
            emitting: self.emitting.clone(),
            frames_tx,
            dropped: self.dropped.clone(),
            pending: Vec::with_capacity(self.frame_samples * 2),
            resampled: Vec::with_capacity(self.frame_samples),
            sequence: 0,
        };

        let stream = self.microphone.open(tap)?;
        self.stream = Some(stream);
        log::info!(
            "Capture: started ({} Hz, {} samples per frame)",
            self.target_rate,
            self.frame_samples
        );

        Ok(frames_rx)
    }

    /// Open or close the frame emitter
    pub fn set_emitting(&self, emitting: bool) {
        self.emitting.store(emitting, Ordering::Release);
    }

    /// Shared handle to the emit gate, for wiring into transport callbacks
    pub fn emit_gate(&self) -> Arc<AtomicBool> {
        self.emitting.clone()
    }

    /// Current volume (0-100) of the most recent analysis window
    pub fn volume(&self) -> f32 {
        if self.stream.is_none() {
            return 0.0;
        }
        match self.meter.lock() {
            Ok(mut meter) => meter.level(),
            Err(_) => 0.0,
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the microphone. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        self.emitting.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            log::info!("Capture: stopped");
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default input device via CPAL.
///
/// CPAL streams are not `Send`, so each opened stream lives on its own thread
/// and is dropped there when the handle is closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self, tap: CaptureTap) -> Result<Box<dyn MicrophoneStream>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("steadycoach-capture".into())
            .spawn(move || match build_input_stream(tap) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until the handle is closed or dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let ready = ready_rx.recv().map_err(|_| {
            AudioError::StreamCreationFailed("capture thread exited during setup".into())
        });

        match ready {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) | Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }
}

struct CpalInputStream {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneStream for CpalInputStream {
    fn close(&mut self) {
        // Dropping the sender wakes the stream thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Capture: stream thread panicked");
            }
        }
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(tap: CaptureTap) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::DeviceUnavailable)?;

    log::info!("Capture: using input device {:?}", device.name());

    let (config, sample_format) = input_config(&device)?;
    log::info!(
        "Capture: device config {} Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        sample_format
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &config, tap),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &config, tap),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &config, tap),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| classify_backend_error(e.to_string()))?;

    Ok(stream)
}

/// Prefer a native 16kHz config; fall back to the device default and resample.
fn input_config(device: &Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(CAPTURE_SAMPLE_RATE);

    if let Ok(mut configs) = device.supported_input_configs() {
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

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => AudioError::DeviceUnavailable,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => AudioError::NoSupportedConfig,
        other => classify_backend_error(other.to_string()),
    })?;
    let format = supported.sample_format();
    Ok((supported.into(), format))
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut tap: CaptureTap,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let source_rate = config.sample_rate.0;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                tap.process_interleaved(&scratch, channels, source_rate);
            },
            |err| log::error!("Capture: stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceUnavailable,
            cpal::BuildStreamError::StreamConfigNotSupported => AudioError::NoSupportedConfig,
            other => classify_backend_error(other.to_string()),
        })
}
