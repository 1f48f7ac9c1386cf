//! RVC v1/v2 synthesizer (`net_g` export).
//!
//! ## Model I/O
//!
//! | Name            | Shape             | DType | Notes |
//! |-----------------|-------------------|-------|-------|
//! | `phone`         | `[1, F, dim]`     | f32   | content features at 10 ms |
//! | `phone_lengths` | `[1]`             | i64   | `F` |
//! | `pitch`         | `[1, F]`          | i64   | coarse bins 1..=255 |
//! | `pitchf`        | `[1, F]`          | f32   | f0 in Hz, 0 = unvoiced |
//! | `ds`            | `[1]`             | i64   | speaker id |
//! | `rnd`           | `[1, 192, F]`     | f32   | N(0, 1) noise |
//! | output          | `[1, 1, F * hop]` | f32   | audio in [-1, 1] |

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::session::{create_session, io_names, ort_err, resolve_name, resolve_or_position};
use crate::device::Device;
use crate::error::{Result, VcError};
use crate::pitch::PitchContour;
use crate::synthesis::{SynthesisRequest, Vocoder};

/// Channels of the prior noise tensor.
const NOISE_CHANNELS: usize = 192;

#[derive(Debug, Clone)]
pub struct OnnxVocoderConfig {
    pub model_path: PathBuf,
    pub sample_rate: u32,
    /// Output samples per input frame; `sample_rate / 100` for every RVC export.
    pub hop_size: usize,
    pub device: Device,
}

impl OnnxVocoderConfig {
    pub fn new(model_path: impl AsRef<Path>, sample_rate: u32) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            sample_rate,
            hop_size: (sample_rate / 100) as usize,
            device: Device::Cpu,
        }
    }
}

/// Tensor names resolved once at load.
struct InputNames {
    phone: String,
    lengths: String,
    pitch: Option<String>,
    pitchf: Option<String>,
    speaker: String,
    noise: Option<String>,
}

pub struct OnnxVocoder {
    config: OnnxVocoderConfig,
    session: Mutex<Session>,
    names: InputNames,
    output_name: String,
}

impl OnnxVocoder {
    pub fn load(config: OnnxVocoderConfig) -> Result<Self> {
        if config.sample_rate == 0 || config.hop_size == 0 {
            return Err(VcError::InvalidConfig(
                "synthesizer sample rate and hop must be > 0".into(),
            ));
        }
        let session = create_session(&config.model_path, config.device)?;
        let (inputs, outputs) = io_names(&session);
        let names = InputNames {
            phone: resolve_or_position(&inputs, &["phone", "feats"], 0, "phone input")?,
            lengths: resolve_or_position(&inputs, &["phone_lengths", "lengths"], 1, "length input")?,
            pitch: resolve_name(&inputs, &["pitch"]),
            pitchf: resolve_name(&inputs, &["pitchf", "nsff0"]),
            speaker: resolve_or_position(
                &inputs,
                &["ds", "sid", "speaker"],
                inputs.len().saturating_sub(2),
                "speaker input",
            )?,
            noise: resolve_name(&inputs, &["rnd", "noise"]),
        };
        let output_name = resolve_or_position(&outputs, &["audio", "output"], 0, "audio output")?;
        info!(
            model = %config.model_path.display(),
            sample_rate = config.sample_rate,
            f0_conditioned = names.pitch.is_some(),
            "synthesizer loaded"
        );
        Ok(Self {
            config,
            session: Mutex::new(session),
            names,
            output_name,
        })
    }
}

impl Vocoder for OnnxVocoder {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn hop_size(&self) -> usize {
        self.config.hop_size
    }

    fn device(&self) -> Device {
        self.config.device
    }

    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Vec<f32>> {
        let frames = request.features.nrows();
        let dim = request.features.ncols();
        if frames == 0 {
            return Ok(Vec::new());
        }
        if request.pitch.len() < frames {
            return Err(VcError::Alignment {
                what: "pitch contour",
                got: request.pitch.len(),
                expected: frames,
            });
        }
        let pitch = &request.pitch[..frames];

        let phone = Array3::from_shape_vec(
            (1, frames, dim),
            request.features.iter().copied().collect(),
        )
        .map_err(ort_err)?;
        let tensor = |e: ort::Error| ort_err(e);

        let mut inputs: Vec<(String, SessionInputValue<'_>)> = vec![
            (
                self.names.phone.clone(),
                Value::from_array(phone).map_err(tensor)?.into(),
            ),
            (
                self.names.lengths.clone(),
                Value::from_array(Array1::from_elem(1, frames as i64))
                    .map_err(tensor)?
                    .into(),
            ),
            (
                self.names.speaker.clone(),
                Value::from_array(Array1::from_elem(1, request.speaker.id as i64))
                    .map_err(tensor)?
                    .into(),
            ),
        ];
        if let Some(name) = &self.names.pitch {
            let coarse = coarse_pitch(pitch);
            inputs.push((
                name.clone(),
                Value::from_array(Array2::from_shape_vec((1, frames), coarse).map_err(ort_err)?)
                    .map_err(tensor)?
                    .into(),
            ));
        }
        if let Some(name) = &self.names.pitchf {
            inputs.push((
                name.clone(),
                Value::from_array(
                    Array2::from_shape_vec((1, frames), pitch.to_vec())
                        .map_err(ort_err)?,
                )
                .map_err(tensor)?
                .into(),
            ));
        }
        if let Some(name) = &self.names.noise {
            inputs.push((
                name.clone(),
                Value::from_array(
                    Array3::from_shape_vec(
                        (1, NOISE_CHANNELS, frames),
                        gaussian_noise(request.seed, NOISE_CHANNELS * frames),
                    )
                    .map_err(ort_err)?,
                )
                .map_err(tensor)?
                .into(),
            ));
        }

        let mut session = self.session.lock();
        let outputs = session.run(inputs).map_err(ort_err)?;
        let (_, audio) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(ort_err)?;
        debug!(frames, samples = audio.len(), "synthesizer ran");
        Ok(audio.iter().map(|s| s.clamp(-1.0, 1.0)).collect())
    }
}

fn coarse_pitch(f0: &[f32]) -> Vec<i64> {
    PitchContour {
        sample_rate: crate::MODEL_SAMPLE_RATE,
        hop_size: crate::FRAME_HOP,
        values: f0.to_vec(),
    }
    .to_coarse()
}

/// `len` standard-normal samples from a seeded generator (Box–Muller).
fn gaussian_noise(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(len + 1);
    while out.len() < len {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f32::consts::TAU * u2;
        out.push(r * theta.cos());
        out.push(r * theta.sin());
    }
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_seeded() {
        assert_eq!(gaussian_noise(7, 33), gaussian_noise(7, 33));
        assert_ne!(gaussian_noise(7, 33), gaussian_noise(8, 33));
        assert_eq!(gaussian_noise(1, 33).len(), 33);
    }

    #[test]
    fn noise_is_roughly_standard() {
        let n = gaussian_noise(42, 20_000);
        let mean = n.iter().sum::<f32>() / n.len() as f32;
        let var = n.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }

    #[test]
    fn coarse_pitch_marks_unvoiced_as_one() {
        assert_eq!(coarse_pitch(&[0.0, 1100.0]), vec![1, 255]);
    }

    #[test]
    fn default_hop_is_ten_ms() {
        assert_eq!(OnnxVocoderConfig::new("m.onnx", 40_000).hop_size, 400);
        assert_eq!(OnnxVocoderConfig::new("m.onnx", 48_000).hop_size, 480);
    }
}
