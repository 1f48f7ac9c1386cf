//! Zero-phase high-pass filter applied to input audio before feature
//! extraction. Removes DC offset and sub-bass rumble that would otherwise
//! confuse the pitch estimators.
//!
//! Second-order Butterworth section (RBJ cookbook coefficients) run forward
//! then backward, so the result has no phase shift and the effective
//! magnitude response is squared (-6 dB at the cutoff).

use std::f32::consts::PI;

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Biquad {
    fn highpass(cutoff_hz: f32, sample_rate: u32) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f32;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let q = std::f32::consts::FRAC_1_SQRT_2;
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Direct form I over `samples`, in place.
    fn run(&self, samples: &mut [f32]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0f32, 0f32, 0f32, 0f32);
        for s in samples.iter_mut() {
            let x0 = *s;
            let y0 = self.b0 * x0 + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *s = y0;
        }
    }
}

/// High-pass `samples` in place at `cutoff_hz`.
///
/// A cutoff at or above Nyquist leaves the signal untouched.
pub fn highpass(samples: &mut [f32], cutoff_hz: f32, sample_rate: u32) {
    if samples.is_empty() || cutoff_hz <= 0.0 || cutoff_hz >= sample_rate as f32 / 2.0 {
        return;
    }
    let section = Biquad::highpass(cutoff_hz, sample_rate);
    section.run(samples);
    samples.reverse();
    section.run(samples);
    samples.reverse();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::rms;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn removes_dc_offset() {
        let mut samples = vec![0.5f32; 16_000];
        highpass(&mut samples, 48.0, 16_000);
        let mean = samples[4_000..12_000].iter().sum::<f32>() / 8_000.0;
        assert!(mean.abs() < 1e-3, "mean={mean}");
    }

    #[test]
    fn passes_speech_band() {
        let mut samples = sine(440.0, 16_000, 16_000);
        let before = rms(&samples[2_000..14_000]);
        highpass(&mut samples, 48.0, 16_000);
        let after = rms(&samples[2_000..14_000]);
        assert!((after / before - 1.0).abs() < 0.02, "gain={}", after / before);
    }

    #[test]
    fn attenuates_rumble() {
        let mut samples = sine(10.0, 16_000, 32_000);
        let before = rms(&samples[8_000..24_000]);
        highpass(&mut samples, 48.0, 16_000);
        let after = rms(&samples[8_000..24_000]);
        assert!(after < before * 0.1, "gain={}", after / before);
    }
}
