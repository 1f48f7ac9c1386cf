//! `SpectralContentModel` — weight-free content backend producing log-mel
//! frames.
//!
//! It carries no speaker normalisation, so it is not a substitute for a
//! HuBERT-class encoder in production; it exists so the whole pipeline can
//! run deterministically without model files (tests, smoke runs, the
//! `HarmonicVocoder` source-filter path).
//!
//! ## Frame parameters
//!
//! | Parameter   | Value          |
//! |-------------|----------------|
//! | Hann window | 400 samples    |
//! | FFT size    | 512            |
//! | Hop length  | 160 (10 ms)    |
//! | Mel range   | 0–8 000 Hz     |
//! | Output      | `ln(mel + 1e-6)` |

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::ContentModel;
use crate::error::Result;
use crate::pitch::padded_segment;
use crate::{FRAME_HOP, MODEL_SAMPLE_RATE};

const WIN_LENGTH: usize = 400;
const FFT_SIZE: usize = 512;
/// Mel range upper edge (Hz).
pub const MEL_FMAX: f32 = 8_000.0;
/// Floor added before the log.
const LOG_FLOOR: f32 = 1e-6;

pub struct SpectralContentModel {
    n_mels: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl SpectralContentModel {
    pub fn new(n_mels: usize) -> Self {
        let n_mels = n_mels.max(1);
        let hann_window = build_hann_window(WIN_LENGTH);
        let mel_filters = build_mel_filters(
            FFT_SIZE,
            MODEL_SAMPLE_RATE,
            n_mels,
            (0.0, MEL_FMAX),
            MelScale::Slaney,
        );
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        Self {
            n_mels,
            mel_filters,
            hann_window,
            fft,
        }
    }

    /// Log-mel frame for `samples` centred on `center`.
    fn frame(&self, samples: &[f32], center: isize, scratch: &mut [Complex<f32>]) -> Vec<f32> {
        let segment = padded_segment(samples, center - (WIN_LENGTH / 2) as isize, WIN_LENGTH);
        for (k, slot) in scratch.iter_mut().enumerate() {
            let v = if k < WIN_LENGTH {
                segment[k] * self.hann_window[k]
            } else {
                0.0
            };
            *slot = Complex::new(v, 0.0);
        }
        self.fft.process(scratch);

        let power: Vec<f32> = scratch[..FFT_SIZE / 2 + 1]
            .iter()
            .map(|c| c.norm_sqr())
            .collect();
        self.mel_filters
            .iter()
            .map(|filter| {
                let energy: f32 = filter.iter().zip(&power).map(|(w, p)| w * p).sum();
                (energy + LOG_FLOOR).ln()
            })
            .collect()
    }
}

impl Default for SpectralContentModel {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ContentModel for SpectralContentModel {
    fn hop_size(&self) -> usize {
        FRAME_HOP
    }

    fn dim(&self) -> usize {
        self.n_mels
    }

    fn encode(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let frames = samples.len() / FRAME_HOP;
        let mut out = Array2::zeros((frames, self.n_mels));
        let mut scratch = vec![Complex::new(0f32, 0f32); FFT_SIZE];
        for i in 0..frames {
            let center = (i * FRAME_HOP + FRAME_HOP / 2) as isize;
            let frame = self.frame(samples, center, &mut scratch);
            for (m, v) in frame.into_iter().enumerate() {
                out[[i, m]] = v;
            }
        }
        Ok(out)
    }
}

/// Hz ↔ mel mapping used to space filterbank bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MelScale {
    /// Linear below 1 kHz, logarithmic above (librosa default).
    Slaney,
    /// `2595 · log10(1 + f / 700)`.
    #[cfg_attr(not(feature = "onnx"), allow(dead_code))]
    Htk,
}

impl MelScale {
    fn to_mel(self, hz: f32) -> f32 {
        match self {
            MelScale::Slaney => hz_to_mel_slaney(hz),
            MelScale::Htk => 2595.0 * (1.0 + hz / 700.0).log10(),
        }
    }

    fn to_hz(self, mel: f32) -> f32 {
        match self {
            MelScale::Slaney => mel_to_hz_slaney(mel),
            MelScale::Htk => 700.0 * (10f32.powf(mel / 2595.0) - 1.0),
        }
    }

    /// `n_mels + 2` band edges evenly spaced on this scale.
    fn edges(self, n_mels: usize, fmin: f32, fmax: f32) -> Vec<f32> {
        let mel_min = self.to_mel(fmin);
        let mel_max = self.to_mel(fmax);
        (0..=(n_mels + 1))
            .map(|i| self.to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
            .collect()
    }
}

/// Centre frequency (Hz) of each band of a Slaney filterbank.
pub fn mel_band_centers(n_mels: usize, fmin: f32, fmax: f32) -> Vec<f32> {
    let edges = MelScale::Slaney.edges(n_mels, fmin, fmax);
    edges[1..=n_mels].to_vec()
}

pub(crate) fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Area-normalised triangular filters, `n_mels × (fft_size / 2 + 1)`.
pub(crate) fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    (fmin, fmax): (f32, f32),
    scale: MelScale,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let hz_pts = scale.edges(n_mels, fmin, fmax);
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for (m, filter) in filters.iter_mut().enumerate() {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filter[k] = (w * enorm).max(0.0);
        }
    }
    filters
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp; // 15
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}
