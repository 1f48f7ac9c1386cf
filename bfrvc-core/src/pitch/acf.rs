//! Autocorrelation pitch estimator.
//!
//! ## Algorithm
//!
//! 1. Cut a window of `2 * sr / F0_MIN` samples (rounded up to a power of two)
//!    centred on the frame.
//! 2. Autocorrelation via FFT: `r = IFFT(|FFT(x)|²)` with 2× zero padding so
//!    the correlation is linear, not circular.
//! 3. Normalise by `r(0)` and correct the lag bias (`W / (W - τ)`).
//! 4. Pick the strongest lag in `[sr / F0_MAX, sr / F0_MIN]`, then prefer the
//!    shortest local peak within 15 % of it (guards against octave-down errors).
//! 5. Voiced when the normalised peak is at least `VOICING_THRESHOLD` and the
//!    frame is above the silence floor; parabolic interpolation refines the lag.

use rustfft::{num_complex::Complex, FftPlanner};

use super::{padded_segment, parabolic_offset, F0Method, PitchEstimator, F0_MAX, F0_MIN, SILENCE_RMS, UNVOICED};
use crate::audio::rms;
use crate::error::Result;

/// Minimum normalised autocorrelation peak for a voiced frame.
const VOICING_THRESHOLD: f32 = 0.5;
/// Fraction of the global peak a shorter lag must reach to win.
const OCTAVE_TOLERANCE: f32 = 0.85;

#[derive(Debug, Clone, Copy, Default)]
pub struct AcfEstimator;

impl PitchEstimator for AcfEstimator {
    fn method(&self) -> F0Method {
        F0Method::Acf
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32, hop_size: usize) -> Result<Vec<f32>> {
        let frames = samples.len() / hop_size;
        let sr = sample_rate as f32;
        let lag_min = (sr / F0_MAX).floor().max(2.0) as usize;
        let lag_max = (sr / F0_MIN).ceil() as usize;
        let window = (2 * lag_max).next_power_of_two();
        let fft_len = window * 2;

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let mut spectrum = vec![Complex::new(0f32, 0f32); fft_len];

        let mut out = Vec::with_capacity(frames);
        for i in 0..frames {
            let center = (i * hop_size + hop_size / 2) as isize;
            let mut segment = padded_segment(samples, center - (window / 2) as isize, window);
            if rms(&segment) < SILENCE_RMS {
                out.push(UNVOICED);
                continue;
            }
            let mean = segment.iter().sum::<f32>() / window as f32;
            segment.iter_mut().for_each(|s| *s -= mean);

            for (k, slot) in spectrum.iter_mut().enumerate() {
                *slot = Complex::new(segment.get(k).copied().unwrap_or(0.0), 0.0);
            }
            forward.process(&mut spectrum);
            for c in spectrum.iter_mut() {
                *c = Complex::new(c.norm_sqr(), 0.0);
            }
            inverse.process(&mut spectrum);

            let r0 = spectrum[0].re;
            if r0 <= f32::EPSILON {
                out.push(UNVOICED);
                continue;
            }
            let upper = lag_max.min(window - 1);
            let norm: Vec<f32> = (0..=upper + 1)
                .map(|tau| {
                    let tau = tau.min(window - 1);
                    spectrum[tau].re / r0 * window as f32 / (window - tau) as f32
                })
                .collect();

            out.push(pick_lag(&norm, lag_min, upper, sr));
        }
        Ok(out)
    }
}

fn pick_lag(norm: &[f32], lag_min: usize, lag_max: usize, sr: f32) -> f32 {
    let (best_lag, best) = (lag_min..=lag_max)
        .map(|tau| (tau, norm[tau]))
        .fold((lag_min, f32::MIN), |acc, (tau, v)| {
            if v > acc.1 {
                (tau, v)
            } else {
                acc
            }
        });
    if best < VOICING_THRESHOLD {
        return UNVOICED;
    }

    let chosen = (lag_min..=lag_max)
        .find(|&tau| {
            let v = norm[tau];
            v >= best * OCTAVE_TOLERANCE && v >= norm[tau - 1] && v >= norm[tau + 1]
        })
        .unwrap_or(best_lag);

    let offset = parabolic_offset(norm[chosen - 1], norm[chosen], norm[chosen + 1]);
    sr / (chosen as f32 + offset)
}
