//! Sample-rate and channel conversion for the capture path
//!
//! Microphones rarely run at the 16kHz the voice protocol expects, so the
//! capture tap mixes device frames down to mono and resamples them with a
//! streaming linear interpolator that carries state across callbacks.

/// Mix interleaved frames down to mono by averaging channels.
pub fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Streaming linear resampler.
///
/// Positions are tracked in input-sample coordinates relative to the start
/// of the current block; a negative position interpolates between the last
/// sample of the previous block and the first sample of this one.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    source_rate: u32,
    target_rate: u32,
    step: f64,
    position: f64,
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let step = if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                source_rate,
                target_rate
            );
            1.0
        } else {
            source_rate as f64 / target_rate as f64
        };

        Self {
            source_rate,
            target_rate,
            step,
            position: 0.0,
            last: None,
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate || self.step == 1.0
    }

    /// Resample one block, appending output samples to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        let len = input.len() as f64;
        while self.position < len - 1.0 {
            let floor = self.position.floor();
            let frac = (self.position - floor) as f32;
            let index = floor as isize;

            let a = if index < 0 {
                self.last.unwrap_or(input[0])
            } else {
                input[index as usize]
            };
            let b = input[(index + 1) as usize];

            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        self.position -= len;
        self.last = input.last().copied();
    }
}
