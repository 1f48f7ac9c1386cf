//! `HarmonicVocoder` — weight-free source-filter synthesis.
//!
//! Each content row is read as a log-energy envelope over mel bands (the
//! layout [`SpectralContentModel`](crate::content::SpectralContentModel)
//! produces). Voiced frames become a sum of harmonics of the frame's f0,
//! each scaled by the envelope at its frequency and by the speaker's band
//! gains; unvoiced frames are silent. No randomness is involved, so the
//! output is a pure function of its inputs.

use std::f32::consts::TAU;

use super::{SynthesisRequest, Vocoder};
use crate::content::spectral::{mel_band_centers, MEL_FMAX};
use crate::error::Result;

/// Upper bound on harmonics per frame.
const MAX_HARMONICS: usize = 48;
/// Maps envelope magnitude to output amplitude.
const LEVEL_SCALE: f32 = 0.05;
/// Ceiling for a single frame's summed amplitude.
const MAX_LEVEL: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct HarmonicVocoder {
    sample_rate: u32,
}

impl HarmonicVocoder {
    /// Output rate; the hop is always 10 ms.
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl Default for HarmonicVocoder {
    fn default() -> Self {
        Self::new(40_000)
    }
}

impl Vocoder for HarmonicVocoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn hop_size(&self) -> usize {
        (self.sample_rate / 100) as usize
    }

    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Vec<f32>> {
        let hop = self.hop_size();
        let sr = self.sample_rate as f32;
        let dim = request.features.ncols();
        let centers = mel_band_centers(dim, 0.0, MEL_FMAX);
        let gains = band_gains(&request.speaker.vector, dim);
        let nyquist = (sr / 2.0).min(MEL_FMAX);

        let mut out = Vec::with_capacity(request.frames() * hop);
        let mut phase = [0f32; MAX_HARMONICS];
        let mut prev_amps = [0f32; MAX_HARMONICS];
        let mut prev_f0 = 0f32;

        for (row, &f0) in request.features.outer_iter().zip(request.pitch) {
            let mut amps = [0f32; MAX_HARMONICS];
            if f0 > 0.0 && dim > 0 {
                let envelope: Vec<f32> = row
                    .iter()
                    .zip(&gains)
                    .map(|(&e, &g)| (0.5 * e.clamp(-60.0, 60.0)).exp() * g)
                    .collect();
                let level = (envelope.iter().map(|a| a * a).sum::<f32>().sqrt() * LEVEL_SCALE)
                    .min(MAX_LEVEL);
                let mut total = 0f32;
                for (h, amp) in amps.iter_mut().enumerate() {
                    let freq = f0 * (h + 1) as f32;
                    if freq >= nyquist {
                        break;
                    }
                    *amp = interpolate(&centers, &envelope, freq);
                    total += *amp;
                }
                if total > 0.0 {
                    amps.iter_mut().for_each(|a| *a *= level / total);
                }
            }

            // Fading out of a voiced run keeps the last pitch running.
            let running_f0 = if f0 > 0.0 { f0 } else { prev_f0 };
            for n in 0..hop {
                let t = n as f32 / hop as f32;
                let mut sample = 0f32;
                for h in 0..MAX_HARMONICS {
                    let amp = prev_amps[h] + (amps[h] - prev_amps[h]) * t;
                    if amp > 0.0 {
                        sample += amp * phase[h].sin();
                    }
                    phase[h] = (phase[h] + TAU * running_f0 * (h + 1) as f32 / sr) % TAU;
                }
                out.push(sample);
            }
            prev_amps = amps;
            prev_f0 = running_f0;
        }
        Ok(out)
    }
}

/// Speaker vector resampled to `dim` bands and read as natural-log gains.
/// An empty vector means flat gain.
fn band_gains(vector: &[f32], dim: usize) -> Vec<f32> {
    if vector.is_empty() {
        return vec![1.0; dim];
    }
    (0..dim)
        .map(|b| {
            let pos = if dim > 1 {
                b as f32 * (vector.len() - 1) as f32 / (dim - 1) as f32
            } else {
                0.0
            };
            let i = pos.floor() as usize;
            let j = (i + 1).min(vector.len() - 1);
            let frac = pos - i as f32;
            (vector[i] * (1.0 - frac) + vector[j] * frac).exp()
        })
        .collect()
}

/// Piecewise-linear lookup of `values` over ascending `centers`, clamped at
/// the ends.
fn interpolate(centers: &[f32], values: &[f32], freq: f32) -> f32 {
    match centers.iter().position(|&c| c >= freq) {
        None => values.last().copied().unwrap_or(0.0),
        Some(0) => values[0],
        Some(i) => {
            let (c0, c1) = (centers[i - 1], centers[i]);
            let frac = (freq - c0) / (c1 - c0).max(f32::EPSILON);
            values[i - 1] + (values[i] - values[i - 1]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::SpeakerEmbedding;
    use ndarray::Array2;

    fn render(pitch: &[f32], fill: f32, speaker: &SpeakerEmbedding) -> Vec<f32> {
        let features = Array2::from_elem((pitch.len(), 32), fill);
        let request = SynthesisRequest {
            features: features.view(),
            pitch,
            speaker,
            seed: 0,
        };
        HarmonicVocoder::new(16_000).synthesize(&request).unwrap()
    }

    #[test]
    fn unvoiced_frames_are_silent() {
        let out = render(&[0.0; 20], 2.0, &SpeakerEmbedding::id_only(0));
        assert_eq!(out.len(), 20 * 160);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn voiced_frames_have_energy_and_stay_bounded() {
        let out = render(&[200.0; 20], 2.0, &SpeakerEmbedding::id_only(0));
        let peak = out.iter().fold(0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.01, "peak={peak}");
        assert!(peak <= MAX_LEVEL + 1e-3, "peak={peak}");
    }

    #[test]
    fn output_is_deterministic() {
        let speaker = SpeakerEmbedding::new(1, vec![0.0, -1.0, 0.5]);
        let pitch: Vec<f32> = (0..30).map(|i| if i % 7 == 0 { 0.0 } else { 180.0 }).collect();
        assert_eq!(render(&pitch, 1.0, &speaker), render(&pitch, 1.0, &speaker));
    }

    #[test]
    fn speaker_gain_scales_bands() {
        let gains = band_gains(&[0.0, 2f32.ln()], 3);
        assert!((gains[0] - 1.0).abs() < 1e-6);
        assert!((gains[1] - 2f32.sqrt()).abs() < 1e-5);
        assert!((gains[2] - 2.0).abs() < 1e-5);
    }
}
