//! Audio buffers plus loading, resampling, filtering and writing.
//!
//! # Sample layout
//!
//! `AudioBuffer` stores f32 samples in [-1.0, 1.0], interleaved when the
//! buffer has more than one channel. Every inference stage works on mono
//! audio at [`MODEL_SAMPLE_RATE`](crate::MODEL_SAMPLE_RATE); the engine
//! downmixes and resamples once, up front, before chunking.

pub mod filter;
pub mod io;
pub mod resample;

pub use io::{decode, load, write, OutputFormat};
pub use resample::resample;

/// Scale-down threshold used when conditioning input audio.
pub const INPUT_PEAK_LIMIT: f32 = 0.95;
/// Scale-down threshold applied to the final output.
pub const OUTPUT_PEAK_LIMIT: f32 = 0.99;

/// A block of PCM samples at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// Interleaved f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Average all channels into one. Mono buffers are returned unchanged.
    pub fn to_mono(&self) -> AudioBuffer {
        let ch = usize::from(self.channels.max(1));
        if ch == 1 {
            return self.clone();
        }
        let mono = self
            .samples
            .chunks(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect();
        AudioBuffer::mono(mono, self.sample_rate)
    }

    /// Split interleaved samples into one vector per channel.
    pub fn deinterleave(&self) -> Vec<Vec<f32>> {
        let ch = usize::from(self.channels.max(1));
        let mut planes = vec![Vec::with_capacity(self.frames()); ch];
        for frame in self.samples.chunks(ch) {
            for (c, s) in frame.iter().enumerate() {
                planes[c].push(*s);
            }
        }
        planes
    }

    /// Inverse of [`deinterleave`](Self::deinterleave). Planes are cut to the
    /// shortest one.
    pub fn interleave(planes: &[Vec<f32>], sample_rate: u32) -> AudioBuffer {
        let ch = planes.len().max(1);
        let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
        let mut samples = Vec::with_capacity(frames * ch);
        for i in 0..frames {
            for plane in planes {
                samples.push(plane[i]);
            }
        }
        AudioBuffer::new(samples, sample_rate, ch as u16)
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Scale the buffer down so its peak does not exceed `limit`.
    /// Quieter buffers are left untouched.
    pub fn normalize_peak(&mut self, limit: f32) {
        limit_peak(&mut self.samples, limit);
    }
}

pub(crate) fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0f32, |acc, s| acc.max(s.abs()))
}

pub(crate) fn limit_peak(samples: &mut [f32], limit: f32) {
    let p = peak(samples);
    if p <= limit || p <= f32::EPSILON {
        return;
    }
    let gain = limit / p;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Root-mean-square of a sample slice.
pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
