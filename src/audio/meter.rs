//! Microphone volume metering for the call UI
//!
//! Keeps the most recent analysis window of captured samples and derives a
//! 0-100 volume level by averaging frequency-bin magnitudes, the same shape
//! of reading a browser analyser node gives.
//!
//! The reading is advisory only. It never influences what is sent to the
//! remote model.

use std::collections::VecDeque;
use std::f32::consts::PI;

/// Analysis window size in samples
pub const FFT_SIZE: usize = 256;

/// Number of frequency bins produced per window
const BIN_COUNT: usize = FFT_SIZE / 2;

/// Magnitudes below this are shown as silence
const MIN_DECIBELS: f32 = -100.0;

/// Magnitudes above this are shown as full scale
const MAX_DECIBELS: f32 = -30.0;

/// EMA smoothing factor (0.2 = 20% new value, 80% previous)
const EMA_ALPHA: f32 = 0.2;

/// Volume meter fed from the capture tap and read from the UI.
pub struct VolumeMeter {
    samples: VecDeque<f32>,
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothing: EmaState,
}

impl VolumeMeter {
    pub fn new() -> Self {
        // Blackman window, as analyser nodes apply before the transform
        let window = (0..FFT_SIZE)
            .map(|n| {
                let x = n as f32 / FFT_SIZE as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        let cos_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f32 / FFT_SIZE as f32).cos())
            .collect();
        let sin_table = (0..FFT_SIZE)
            .map(|n| (2.0 * PI * n as f32 / FFT_SIZE as f32).sin())
            .collect();

        Self {
            samples: VecDeque::with_capacity(FFT_SIZE),
            window,
            cos_table,
            sin_table,
            smoothing: EmaState::new(),
        }
    }

    /// Add samples, keeping only the latest analysis window
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        if len >= FFT_SIZE {
            self.samples.clear();
            self.samples.extend(&samples[len - FFT_SIZE..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(FFT_SIZE);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// Current volume in the range 0-100
    pub fn level(&mut self) -> f32 {
        let mut bins = self.magnitudes();
        self.smoothing.apply(&mut bins);

        let range = MAX_DECIBELS - MIN_DECIBELS;
        let total: f32 = bins
            .iter()
            .map(|&magnitude| {
                if magnitude <= 0.0 {
                    return 0.0;
                }
                let db = 20.0 * magnitude.log10();
                ((db - MIN_DECIBELS) / range).clamp(0.0, 1.0)
            })
            .sum();

        (total / BIN_COUNT as f32 * 100.0).clamp(0.0, 100.0)
    }

    /// Windowed DFT magnitudes of the current window, zero-padded at the front
    fn magnitudes(&self) -> [f32; BIN_COUNT] {
        let mut bins = [0.0f32; BIN_COUNT];
        if self.samples.is_empty() {
            return bins;
        }

        let offset = FFT_SIZE - self.samples.len();
        let mut frame = [0.0f32; FFT_SIZE];
        for (i, &sample) in self.samples.iter().enumerate() {
            frame[offset + i] = sample * self.window[offset + i];
        }

        for (k, bin) in bins.iter_mut().enumerate() {
            let mut re = 0.0f32;
            let mut im = 0.0f32;
            for (n, &x) in frame.iter().enumerate() {
                let idx = (k * n) % FFT_SIZE;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            *bin = (re * re + im * im).sqrt() / FFT_SIZE as f32;
        }

        bins
    }

    /// Drop buffered audio and smoothing history
    pub fn reset(&mut self) {
        self.samples.clear();
        self.smoothing.reset();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// EMA smoothing across successive readings:
/// smoothed[i] = alpha * current[i] + (1 - alpha) * previous[i]
struct EmaState {
    prev: [f32; BIN_COUNT],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev: [0.0f32; BIN_COUNT],
            initialized: false,
        }
    }

    fn apply(&mut self, bins: &mut [f32; BIN_COUNT]) {
        if !self.initialized {
            self.prev = *bins;
            self.initialized = true;
            return;
        }

        for (bin, prev) in bins.iter_mut().zip(self.prev.iter()) {
            *bin = EMA_ALPHA * *bin + (1.0 - EMA_ALPHA) * prev;
        }

        self.prev = *bins;
    }

    fn reset(&mut self) {
        self.prev = [0.0f32; BIN_COUNT];
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * PI * 440.0 / 16000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_window_bounded() {
        let mut meter = VolumeMeter::new();
        meter.push_samples(&vec![0.1; 1000]);
        assert_eq!(meter.len(), FFT_SIZE);

        meter.push_samples(&[0.2; 10]);
        assert_eq!(meter.len(), FFT_SIZE);
    }

    #[test]
    fn test_push_samples_incremental() {
        let mut meter = VolumeMeter::new();
        meter.push_samples(&[0.1, 0.2]);
        assert_eq!(meter.len(), 2);
        meter.push_samples(&[0.3, 0.4, 0.5]);
        assert_eq!(meter.len(), 5);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut meter = VolumeMeter::new();
        assert_eq!(meter.level(), 0.0);

        meter.push_samples(&vec![0.0; FFT_SIZE]);
        assert_eq!(meter.level(), 0.0);
    }

    #[test]
    fn test_loud_tone_reads_higher_than_quiet_tone() {
        let mut loud = VolumeMeter::new();
        loud.push_samples(&tone(0.9, FFT_SIZE));
        let loud_level = loud.level();

        let mut quiet = VolumeMeter::new();
        quiet.push_samples(&tone(0.001, FFT_SIZE));
        let quiet_level = quiet.level();

        assert!(loud_level > quiet_level, "{} <= {}", loud_level, quiet_level);
        assert!(loud_level > 0.0);
    }

    #[test]
    fn test_level_in_range() {
        let mut meter = VolumeMeter::new();
        meter.push_samples(&vec![1.0; FFT_SIZE]);
        for _ in 0..5 {
            let level = meter.level();
            assert!((0.0..=100.0).contains(&level), "level {}", level);
        }
    }

    #[test]
    fn test_smoothing_decays_after_silence() {
        let mut meter = VolumeMeter::new();
        meter.push_samples(&tone(0.8, FFT_SIZE));
        let first = meter.level();

        meter.push_samples(&vec![0.0; FFT_SIZE]);
        let second = meter.level();

        // Smoothed: drops, but not straight to zero
        assert!(second < first);
        assert!(second > 0.0);
    }

    #[test]
    fn test_reset() {
        let mut meter = VolumeMeter::new();
        meter.push_samples(&tone(0.8, FFT_SIZE));
        meter.level();
        meter.reset();
        assert_eq!(meter.len(), 0);
        assert_eq!(meter.level(), 0.0);
    }
}
