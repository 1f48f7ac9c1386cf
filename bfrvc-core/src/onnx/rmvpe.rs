//! RMVPE neural pitch estimator.
//!
//! ## Model I/O
//!
//! | Name    | Shape             | DType | Direction |
//! |---------|-------------------|-------|-----------|
//! | `input` | `[1, 128, F]`     | f32   | in  (log-mel, F a multiple of 32) |
//! | output  | `[1, F, 360]`     | f32   | out (pitch salience) |
//!
//! Salience bin `i` sits at `20 * i + 1997.38` cents above 10 Hz.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::{debug, info};

use super::session::{create_session, io_names, ort_err, resolve_or_position};
use crate::audio::resample::resample_mono;
use crate::content::spectral::{build_hann_window, build_mel_filters, MelScale};
use crate::device::Device;
use crate::error::{Result, VcError};
use crate::pitch::{padded_segment, F0Method, UNVOICED};
use crate::{FRAME_HOP, MODEL_SAMPLE_RATE};

const N_MELS: usize = 128;
const N_FFT: usize = 1024;
const MEL_FMIN: f32 = 30.0;
const MEL_FMAX: f32 = 8_000.0;
const LOG_CLAMP: f32 = 1e-5;
const SALIENCE_BINS: usize = 360;
const CENTS_OFFSET: f32 = 1997.379_4;
const CENTS_PER_BIN: f32 = 20.0;
/// Salience below this marks the frame unvoiced.
const VOICING_THRESHOLD: f32 = 0.03;
/// Bins on each side of the peak used for the weighted average.
const LOCAL_RADIUS: usize = 4;
/// The U-Net downsamples time five times.
const FRAME_MULTIPLE: usize = 32;

pub struct OnnxPitchModel {
    model_path: PathBuf,
    device: Device,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    mel_filters: Vec<Vec<f32>>,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl OnnxPitchModel {
    pub fn load(model_path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let model_path = model_path.as_ref().to_path_buf();
        let session = create_session(&model_path, device)?;
        let (inputs, outputs) = io_names(&session);
        let input_name = resolve_or_position(&inputs, &["input", "mel", "mels"], 0, "mel input")?;
        let output_name =
            resolve_or_position(&outputs, &["output", "hidden", "salience"], 0, "salience output")?;
        info!(model = %model_path.display(), %device, "rmvpe loaded");
        Ok(Self {
            model_path,
            device,
            session: Mutex::new(session),
            input_name,
            output_name,
            mel_filters: build_mel_filters(
                N_FFT,
                MODEL_SAMPLE_RATE,
                N_MELS,
                (MEL_FMIN, MEL_FMAX),
                MelScale::Htk,
            ),
            window: build_hann_window(N_FFT),
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Centred log-mel spectrogram at 16 kHz, `N_MELS × frames` in row-major
    /// order, with the frame axis zero-padded to `padded` columns.
    fn log_mel(&self, samples: &[f32], frames: usize, padded: usize) -> Vec<f32> {
        let mut mel = vec![(LOG_CLAMP).ln(); N_MELS * padded];
        let mut scratch = vec![Complex::new(0f32, 0f32); N_FFT];
        for t in 0..frames {
            let start = (t * FRAME_HOP) as isize - (N_FFT / 2) as isize;
            let segment = padded_segment(samples, start, N_FFT);
            for (k, slot) in scratch.iter_mut().enumerate() {
                *slot = Complex::new(segment[k] * self.window[k], 0.0);
            }
            self.fft.process(&mut scratch);
            let magnitude: Vec<f32> = scratch[..N_FFT / 2 + 1].iter().map(|c| c.norm()).collect();
            for (m, filter) in self.mel_filters.iter().enumerate() {
                let energy: f32 = filter.iter().zip(&magnitude).map(|(w, a)| w * a).sum();
                mel[m * padded + t] = energy.max(LOG_CLAMP).ln();
            }
        }
        mel
    }

    /// f0 on the 10 ms model grid.
    fn infer(&self, samples_16k: &[f32]) -> Result<Vec<f32>> {
        let frames = samples_16k.len() / FRAME_HOP + 1;
        let padded = frames.div_ceil(FRAME_MULTIPLE) * FRAME_MULTIPLE;
        let mel = self.log_mel(samples_16k, frames, padded);
        let input = Value::from_array(
            Array3::from_shape_vec((1, N_MELS, padded), mel).map_err(ort_err)?,
        )
        .map_err(|e: ort::Error| ort_err(e))?;
        let inputs: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), input.into())];

        let mut session = self.session.lock();
        let outputs = session.run(inputs).map_err(ort_err)?;
        let (shape, salience) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(ort_err)?;
        let bins = shape.last().copied().unwrap_or(0).max(0) as usize;
        if bins != SALIENCE_BINS {
            return Err(VcError::Model(format!(
                "rmvpe output has {bins} bins per frame, expected {SALIENCE_BINS}"
            )));
        }
        let f0: Vec<f32> = salience
            .chunks_exact(SALIENCE_BINS)
            .take(frames)
            .map(decode_frame)
            .collect();
        debug!(frames, padded, voiced = f0.iter().filter(|&&f| f > 0.0).count(), "rmvpe ran");
        Ok(f0)
    }
}

impl crate::pitch::PitchEstimator for OnnxPitchModel {
    fn method(&self) -> F0Method {
        F0Method::Rmvpe
    }

    fn device(&self) -> Device {
        self.device
    }

    fn estimate(&self, samples: &[f32], sample_rate: u32, hop_size: usize) -> Result<Vec<f32>> {
        let frames = samples.len() / hop_size.max(1);
        if frames == 0 {
            return Ok(Vec::new());
        }
        let resampled;
        let samples_16k = if sample_rate == MODEL_SAMPLE_RATE {
            samples
        } else {
            resampled = resample_mono(samples, sample_rate, MODEL_SAMPLE_RATE)?;
            &resampled
        };
        let grid = self.infer(samples_16k)?;
        Ok(regrid(&grid, frames, sample_rate, hop_size))
    }
}

/// Salience row → Hz via a weighted average of the bins around the peak.
fn decode_frame(row: &[f32]) -> f32 {
    let (peak, &peak_value) = row
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .unwrap_or((0, &0.0));
    if peak_value <= VOICING_THRESHOLD {
        return UNVOICED;
    }
    let lo = peak.saturating_sub(LOCAL_RADIUS);
    let hi = (peak + LOCAL_RADIUS + 1).min(row.len());
    let (weighted, total) = row[lo..hi]
        .iter()
        .enumerate()
        .fold((0f32, 0f32), |(acc, sum), (i, &w)| {
            let cents = CENTS_PER_BIN * (lo + i) as f32 + CENTS_OFFSET;
            (acc + cents * w, sum + w)
        });
    if total <= 0.0 {
        return UNVOICED;
    }
    let f0 = 10.0 * 2f32.powf(weighted / total / 1200.0);
    if f0 <= 10.0 {
        UNVOICED
    } else {
        f0
    }
}

/// Map the 10 ms model grid onto `frames` frames of `hop_size` at
/// `sample_rate`, taking the nearest model frame to each frame centre.
fn regrid(grid: &[f32], frames: usize, sample_rate: u32, hop_size: usize) -> Vec<f32> {
    if grid.is_empty() {
        return vec![UNVOICED; frames];
    }
    let den = sample_rate as u64 * FRAME_HOP as u64;
    (0..frames)
        .map(|i| {
            let num = (i * hop_size + hop_size / 2) as u64 * MODEL_SAMPLE_RATE as u64;
            let j = ((2 * num + den) / (2 * den)) as usize;
            grid[j.min(grid.len() - 1)]
        })
        .collect()
}
