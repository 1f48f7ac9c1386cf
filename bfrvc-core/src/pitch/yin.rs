//! YIN pitch estimator (de Cheveigné & Kawahara, 2002).
//!
//! Difference function over an integration window of one longest period,
//! cumulative-mean normalisation, absolute threshold, parabolic refinement.
//! Frames whose normalised difference never dips below the threshold are
//! reported unvoiced instead of falling back to the global minimum.

use super::{padded_segment, parabolic_offset, F0Method, PitchEstimator, F0_MAX, F0_MIN, SILENCE_RMS, UNVOICED};
use crate::audio::rms;
use crate::error::Result;

/// Absolute threshold on the normalised difference function.
const YIN_THRESHOLD: f32 = 0.15;

#[derive(Debug, Clone, Copy, Default)]
pub struct YinEstimator;

impl PitchEstimator for YinEstimator {
    fn method(&self) -> F0Method {
        F0Method::Yin
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32, hop_size: usize) -> Result<Vec<f32>> {
        let frames = samples.len() / hop_size;
        let sr = sample_rate as f32;
        let tau_min = (sr / F0_MAX).floor().max(2.0) as usize;
        let tau_max = (sr / F0_MIN).ceil() as usize;
        let integration = tau_max;
        let span = integration + tau_max + 1;

        let mut diff = vec![0f32; tau_max + 2];
        let mut cmnd = vec![1f32; tau_max + 2];

        let mut out = Vec::with_capacity(frames);
        for i in 0..frames {
            let center = (i * hop_size + hop_size / 2) as isize;
            let segment = padded_segment(samples, center - (span / 2) as isize, span);
            if rms(&segment) < SILENCE_RMS {
                out.push(UNVOICED);
                continue;
            }

            for (tau, d) in diff.iter_mut().enumerate().skip(1) {
                *d = segment[..integration]
                    .iter()
                    .zip(&segment[tau..tau + integration])
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
            }

            let mut running = 0f32;
            for tau in 1..diff.len() {
                running += diff[tau];
                cmnd[tau] = if running > 0.0 {
                    diff[tau] * tau as f32 / running
                } else {
                    1.0
                };
            }

            out.push(pick_period(&cmnd, tau_min, tau_max, sr));
        }
        Ok(out)
    }
}

fn pick_period(cmnd: &[f32], tau_min: usize, tau_max: usize, sr: f32) -> f32 {
    let Some(mut tau) = (tau_min..=tau_max).find(|&t| cmnd[t] < YIN_THRESHOLD) else {
        return UNVOICED;
    };
    while tau < tau_max && cmnd[tau + 1] < cmnd[tau] {
        tau += 1;
    }
    let offset = parabolic_offset(cmnd[tau - 1], cmnd[tau], cmnd[tau + 1]);
    sr / (tau as f32 + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pitch::tests::sine;

    #[test]
    fn tracks_pure_tone() {
        let samples = sine(150.0, 16_000, 16_000);
        let out = YinEstimator.estimate(&samples, 16_000, 160).unwrap();
        assert_eq!(out.len(), 100);
        for &f in &out[10..90] {
            assert!((f - 150.0).abs() < 150.0 * 0.02, "f0={f}");
        }
    }

    #[test]
    fn works_at_other_rates() {
        let samples = sine(300.0, 44_100, 44_100);
        let out = YinEstimator.estimate(&samples, 44_100, 441).unwrap();
        for &f in &out[10..90] {
            assert!((f - 300.0).abs() < 300.0 * 0.02, "f0={f}");
        }
    }

    #[test]
    fn white_noise_is_mostly_unvoiced() {
        // xorshift keeps the test deterministic without an RNG dependency.
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let noise: Vec<f32> = (0..16_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 40) as f32 / (1u64 << 24) as f32 - 0.5
            })
            .collect();
        let out = YinEstimator.estimate(&noise, 16_000, 160).unwrap();
        let voiced = out.iter().filter(|&&f| f > UNVOICED).count();
        assert!(voiced < out.len() / 4, "voiced={voiced}");
    }
}
