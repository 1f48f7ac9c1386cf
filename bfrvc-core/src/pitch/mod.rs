//! Fundamental-frequency (f0) extraction.
//!
//! The `PitchEstimator` trait is the extensibility point: `AcfEstimator`
//! and `YinEstimator` run on the CPU with no model, while the neural RMVPE
//! backend (feature `onnx`) is supplied pre-loaded by the caller. Every
//! estimator emits one value per `hop_size` samples, so everything downstream
//! is method-agnostic.
//!
//! Unvoiced frames carry [`UNVOICED`] (0 Hz).

pub mod acf;
pub mod yin;

pub use acf::AcfEstimator;
pub use yin::YinEstimator;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::{rms, AudioBuffer};
use crate::device::Device;
use crate::error::{Result, VcError};

/// Sentinel for frames without a detectable pitch.
pub const UNVOICED: f32 = 0.0;
/// Lowest f0 the estimators search for (Hz).
pub const F0_MIN: f32 = 50.0;
/// Highest f0 the estimators search for (Hz).
pub const F0_MAX: f32 = 1100.0;
/// Frames (and whole inputs) quieter than this RMS are treated as unvoiced.
pub const SILENCE_RMS: f32 = 1e-3;

/// Pitch estimation strategy, selected per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum F0Method {
    /// FFT autocorrelation.
    Acf,
    /// YIN cumulative-mean-normalised difference.
    Yin,
    /// Neural RMVPE model (needs a loaded pitch model).
    Rmvpe,
}

impl F0Method {
    pub fn as_str(self) -> &'static str {
        match self {
            F0Method::Acf => "acf",
            F0Method::Yin => "yin",
            F0Method::Rmvpe => "rmvpe",
        }
    }

    /// Whether the method runs a model on the compute device.
    pub fn is_neural(self) -> bool {
        matches!(self, F0Method::Rmvpe)
    }
}

impl fmt::Display for F0Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for F0Method {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acf" | "autocorrelation" => Ok(F0Method::Acf),
            "yin" => Ok(F0Method::Yin),
            "rmvpe" => Ok(F0Method::Rmvpe),
            other => Err(VcError::UnsupportedMethod(format!(
                "unknown f0 method '{other}'"
            ))),
        }
    }
}

/// Per-frame f0 track aligned with the content frames.
#[derive(Debug, Clone, PartialEq)]
pub struct PitchContour {
    pub sample_rate: u32,
    pub hop_size: usize,
    /// Hz per frame; [`UNVOICED`] where no pitch was found.
    pub values: Vec<f32>,
}

impl PitchContour {
    pub fn unvoiced(frames: usize, sample_rate: u32, hop_size: usize) -> Self {
        Self {
            sample_rate,
            hop_size,
            values: vec![UNVOICED; frames],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_voiced(&self, frame: usize) -> bool {
        self.values.get(frame).is_some_and(|&f| f > UNVOICED)
    }

    pub fn voiced_frames(&self) -> usize {
        self.values.iter().filter(|&&f| f > UNVOICED).count()
    }

    pub fn is_all_unvoiced(&self) -> bool {
        self.voiced_frames() == 0
    }

    /// Multiply voiced frames by `2^(semitones / 12)`.
    pub fn shift(&mut self, semitones: i32) {
        if semitones == 0 {
            return;
        }
        let factor = 2f32.powf(semitones as f32 / 12.0);
        for f in self.values.iter_mut().filter(|f| **f > UNVOICED) {
            *f *= factor;
        }
    }

    pub fn truncate(&mut self, frames: usize) {
        self.values.truncate(frames);
    }

    /// Quantise to the 1..=255 mel-scale bins RVC synthesizers take as their
    /// coarse pitch input. Unvoiced frames map to bin 1.
    pub fn to_coarse(&self) -> Vec<i64> {
        let mel = |f: f32| 1127.0 * (1.0 + f / 700.0).ln();
        let mel_min = mel(F0_MIN);
        let mel_max = mel(F0_MAX);
        self.values
            .iter()
            .map(|&f| {
                let mut m = mel(f.max(0.0));
                if m > 0.0 {
                    m = (m - mel_min) * 254.0 / (mel_max - mel_min) + 1.0;
                }
                m.clamp(1.0, 255.0).round() as i64
            })
            .collect()
    }
}

/// Contract for pitch estimation backends.
pub trait PitchEstimator: Send + Sync {
    fn method(&self) -> F0Method;

    /// Device the estimator runs on; only neural backends leave the CPU.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Estimate f0 for mono `samples`. Frame `i` describes the audio around
    /// sample `i * hop_size + hop_size / 2`; implementations return
    /// `samples.len() / hop_size` values.
    fn estimate(&self, samples: &[f32], sample_rate: u32, hop_size: usize) -> Result<Vec<f32>>;
}

/// Resolves an [`F0Method`] to a backend and applies the shared
/// post-processing (range gate, median smoothing, transposition).
#[derive(Clone, Default)]
pub struct PitchExtractor {
    neural: Option<Arc<dyn PitchEstimator>>,
    filter_radius: usize,
}

impl PitchExtractor {
    /// `neural` backs [`F0Method::Rmvpe`]; `None` makes that method fail
    /// with `VcError::Model`.
    pub fn new(neural: Option<Arc<dyn PitchEstimator>>) -> Self {
        Self {
            neural,
            filter_radius: 0,
        }
    }

    /// Median-filter kernel applied to the raw contour; active when `>= 3`.
    pub fn with_filter_radius(mut self, radius: usize) -> Self {
        self.filter_radius = radius;
        self
    }

    /// Estimate a pitch contour for `buffer` and transpose it.
    ///
    /// # Errors
    /// - `VcError::Model` if a neural method is requested without a model.
    /// - Any error raised by the estimator itself.
    pub fn extract(
        &self,
        buffer: &AudioBuffer,
        hop_size: usize,
        method: F0Method,
        pitch_shift_semitones: i32,
    ) -> Result<PitchContour> {
        if hop_size == 0 {
            return Err(VcError::InvalidConfig("hop_size must be > 0".into()));
        }
        let mono;
        let buffer = if buffer.channels > 1 {
            mono = buffer.to_mono();
            &mono
        } else {
            buffer
        };
        let frames = buffer.samples.len() / hop_size;

        if frames == 0 || rms(&buffer.samples) < SILENCE_RMS {
            debug!(frames, "silent input — all frames unvoiced");
            return Ok(PitchContour::unvoiced(frames, buffer.sample_rate, hop_size));
        }

        let estimator: &dyn PitchEstimator = match method {
            F0Method::Acf => &AcfEstimator,
            F0Method::Yin => &YinEstimator,
            F0Method::Rmvpe => self.neural.as_deref().ok_or_else(|| {
                VcError::Model("f0 method 'rmvpe' requested but no pitch model is loaded".into())
            })?,
        };

        let mut values = estimator.estimate(&buffer.samples, buffer.sample_rate, hop_size)?;
        if values.len() != frames {
            warn!(
                method = %method,
                got = values.len(),
                expected = frames,
                "estimator frame count differs; fitting to hop grid"
            );
            values.resize(frames, UNVOICED);
        }

        for f in values.iter_mut() {
            if !f.is_finite() || *f < F0_MIN || *f > F0_MAX {
                *f = UNVOICED;
            }
        }
        if self.filter_radius >= 3 {
            values = median_filter(&values, self.filter_radius | 1);
        }

        let mut contour = PitchContour {
            sample_rate: buffer.sample_rate,
            hop_size,
            values,
        };
        contour.shift(pitch_shift_semitones);
        debug!(
            method = %method,
            frames,
            voiced = contour.voiced_frames(),
            "pitch extracted"
        );
        Ok(contour)
    }
}

impl fmt::Debug for PitchExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PitchExtractor")
            .field("neural", &self.neural.as_ref().map(|n| n.method()))
            .field("filter_radius", &self.filter_radius)
            .finish()
    }
}

/// Sliding median with zero padding at the edges (odd `kernel`).
fn median_filter(values: &[f32], kernel: usize) -> Vec<f32> {
    let half = kernel / 2;
    let mut window = Vec::with_capacity(kernel);
    (0..values.len())
        .map(|i| {
            window.clear();
            for k in 0..kernel {
                let idx = i as isize + k as isize - half as isize;
                let v = if idx < 0 || idx as usize >= values.len() {
                    0.0
                } else {
                    values[idx as usize]
                };
                window.push(v);
            }
            window.sort_by(|a, b| a.total_cmp(b));
            window[half]
        })
        .collect()
}

/// Sample `samples[start..start + len]`, reading zeros outside the slice.
pub(crate) fn padded_segment(samples: &[f32], start: isize, len: usize) -> Vec<f32> {
    (0..len)
        .map(|k| {
            let idx = start + k as isize;
            if idx < 0 || idx as usize >= samples.len() {
                0.0
            } else {
                samples[idx as usize]
            }
        })
        .collect()
}

/// Vertex offset of the parabola through `(−1, a) (0, b) (1, c)`.
pub(crate) fn parabolic_offset(a: f32, b: f32, c: f32) -> f32 {
    let denom = a - 2.0 * b + c;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin() * 0.4)
            .collect()
    }

    struct FixedEstimator(f32);

    impl PitchEstimator for FixedEstimator {
        fn method(&self) -> F0Method {
            F0Method::Rmvpe
        }

        fn estimate(&self, samples: &[f32], _sr: u32, hop: usize) -> Result<Vec<f32>> {
            Ok(vec![self.0; samples.len() / hop])
        }
    }

    #[test]
    fn unknown_method_is_unsupported() {
        let err = "crepe".parse::<F0Method>().unwrap_err();
        assert!(matches!(err, VcError::UnsupportedMethod(_)));
        assert_eq!("YIN".parse::<F0Method>().unwrap(), F0Method::Yin);
    }

    #[test]
    fn silent_input_is_all_unvoiced() {
        let buf = AudioBuffer::mono(vec![0.0; 16_000], 16_000);
        for method in [F0Method::Acf, F0Method::Yin] {
            let contour = PitchExtractor::default()
                .extract(&buf, 160, method, 3)
                .unwrap();
            assert_eq!(contour.len(), 100);
            assert!(contour.is_all_unvoiced());
        }
    }

    #[test]
    fn zero_shift_is_identity() {
        let buf = AudioBuffer::mono(sine(200.0, 16_000, 16_000), 16_000);
        let extractor = PitchExtractor::new(Some(Arc::new(FixedEstimator(233.3))));
        let plain = extractor.extract(&buf, 160, F0Method::Rmvpe, 0).unwrap();
        assert!(plain.values.iter().all(|&f| f == 233.3));

        let mut shifted = plain.clone();
        shifted.shift(0);
        assert_eq!(shifted, plain);
    }

    #[test]
    fn octave_shift_doubles_voiced_only() {
        let mut contour = PitchContour {
            sample_rate: 16_000,
            hop_size: 160,
            values: vec![0.0, 110.0, 220.0, 0.0],
        };
        contour.shift(12);
        assert_eq!(contour.values[0], UNVOICED);
        assert!((contour.values[1] - 220.0).abs() < 1e-3);
        assert!((contour.values[2] - 440.0).abs() < 1e-3);
        assert_eq!(contour.values[3], UNVOICED);
    }

    #[test]
    fn neural_method_without_model_is_model_error() {
        let buf = AudioBuffer::mono(sine(200.0, 16_000, 4_000), 16_000);
        let err = PitchExtractor::default()
            .extract(&buf, 160, F0Method::Rmvpe, 0)
            .unwrap_err();
        assert!(matches!(err, VcError::Model(_)));
    }

    #[test]
    fn out_of_range_values_become_unvoiced() {
        let buf = AudioBuffer::mono(sine(200.0, 16_000, 1_600), 16_000);
        let extractor = PitchExtractor::new(Some(Arc::new(FixedEstimator(4_000.0))));
        let contour = extractor.extract(&buf, 160, F0Method::Rmvpe, 0).unwrap();
        assert!(contour.is_all_unvoiced());
    }

    #[test]
    fn median_filter_drops_isolated_blips() {
        let raw = [0.0, 0.0, 300.0, 0.0, 0.0, 200.0, 201.0, 202.0, 0.0];
        let smoothed = median_filter(&raw, 3);
        assert_eq!(smoothed[2], 0.0);
        assert_eq!(smoothed[6], 201.0);
    }

    #[test]
    fn coarse_bins_span_expected_range() {
        let contour = PitchContour {
            sample_rate: 16_000,
            hop_size: 160,
            values: vec![UNVOICED, F0_MIN, F0_MAX, 5_000.0],
        };
        assert_eq!(contour.to_coarse(), vec![1, 1, 255, 255]);
    }
}
