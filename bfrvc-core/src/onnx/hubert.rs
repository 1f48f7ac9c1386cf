//! HuBERT / ContentVec content encoder.
//!
//! ## Model I/O
//!
//! | Name     | Shape               | DType | Direction |
//! |----------|---------------------|-------|-----------|
//! | `source` | `[1, 1, T]` or `[1, T]` | f32 | in     |
//! | output   | `[1, dim, F]` or `[1, F, dim]` | f32 | out |
//!
//! `F ≈ T / 320`. The layout of the output is detected from `dim`.

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Axis};
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::session::{create_session, io_names, ort_err, resolve_or_position};
use crate::content::ContentModel;
use crate::device::Device;
use crate::error::{Result, VcError};

#[derive(Debug, Clone)]
pub struct OnnxContentConfig {
    pub model_path: PathBuf,
    /// Embedding width (768 for v2 models, 256 for v1).
    pub dim: usize,
    /// Native hop at 16 kHz.
    pub hop_size: usize,
    /// Feed `[1, 1, T]` (true) or `[1, T]`.
    pub channel_axis: bool,
    pub device: Device,
}

impl OnnxContentConfig {
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            dim: 768,
            hop_size: 320,
            channel_axis: true,
            device: Device::Cpu,
        }
    }
}

pub struct OnnxContentModel {
    config: OnnxContentConfig,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxContentModel {
    pub fn load(config: OnnxContentConfig) -> Result<Self> {
        let session = create_session(&config.model_path, config.device)?;
        let (inputs, outputs) = io_names(&session);
        let input_name =
            resolve_or_position(&inputs, &["source", "feats", "audio", "input"], 0, "audio input")?;
        let output_name = resolve_or_position(
            &outputs,
            &["embed", "logits", "last_hidden_state", "output"],
            0,
            "embedding output",
        )?;
        info!(
            model = %config.model_path.display(),
            dim = config.dim,
            %input_name,
            %output_name,
            "content encoder loaded"
        );
        Ok(Self {
            config,
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl ContentModel for OnnxContentModel {
    fn hop_size(&self) -> usize {
        self.config.hop_size
    }

    fn dim(&self) -> usize {
        self.config.dim
    }

    fn device(&self) -> Device {
        self.config.device
    }

    fn encode(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let n = samples.len();
        let input = if self.config.channel_axis {
            Value::from_array(
                Array3::from_shape_vec((1, 1, n), samples.to_vec()).map_err(ort_err)?,
            )
        } else {
            Value::from_array(Array2::from_shape_vec((1, n), samples.to_vec()).map_err(ort_err)?)
        }
        .map_err(|e: ort::Error| ort_err(e))?;

        let inputs: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.input_name.clone(), input.into())];

        let mut session = self.session.lock();
        let outputs = session.run(inputs).map_err(ort_err)?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(ort_err)?;
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let features = to_frames(&dims, data, self.config.dim)?;
        debug!(samples = n, frames = features.nrows(), "content model ran");
        Ok(features)
    }
}

/// Reshape a `[1, a, b]` output into `frames × dim`, whichever axis holds
/// the embedding.
fn to_frames(dims: &[usize], data: &[f32], dim: usize) -> Result<Array2<f32>> {
    let [batch, a, b] = dims else {
        return Err(VcError::Model(format!(
            "content output has shape {dims:?}, expected rank 3"
        )));
    };
    if *batch != 1 {
        return Err(VcError::Model(format!(
            "content output has batch {batch}, expected 1"
        )));
    }
    let cube = Array3::from_shape_vec((1, *a, *b), data.to_vec()).map_err(ort_err)?;
    let plane = cube.index_axis_move(Axis(0), 0);
    if *b == dim {
        Ok(plane)
    } else if *a == dim {
        Ok(plane.reversed_axes().as_standard_layout().to_owned())
    } else {
        Err(VcError::Model(format!(
            "content output has shape {dims:?}, none of its axes is {dim} wide"
        )))
    }
}
