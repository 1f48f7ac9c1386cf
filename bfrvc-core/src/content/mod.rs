//! Content (phonetic) feature extraction.
//!
//! The `ContentModel` trait decouples the pipeline from any specific
//! backend (built-in spectral frames, ONNX HuBERT/ContentVec, …). Models are
//! read-only at inference time and shared across chunk workers, hence
//! `&self` + `Send + Sync`.
//!
//! `ContentEncoder` owns the frame-grid contract: whatever hop the model runs
//! at natively, its output is brought to one vector per [`FRAME_HOP`]
//! samples so it lines up with the pitch contour.

pub mod spectral;

pub use spectral::SpectralContentModel;

use std::fmt;
use std::sync::Arc;

use ndarray::{Array2, Axis, Slice};
use tracing::{debug, trace};

use crate::audio::{resample, AudioBuffer};
use crate::device::Device;
use crate::error::{Result, VcError};
use crate::{FRAME_HOP, FRAME_TOLERANCE, MODEL_SAMPLE_RATE};

/// Contract for content-embedding backends.
pub trait ContentModel: Send + Sync {
    /// Native frame hop in samples at [`MODEL_SAMPLE_RATE`]. Must be a
    /// multiple of [`FRAME_HOP`].
    fn hop_size(&self) -> usize;

    /// Embedding width.
    fn dim(&self) -> usize;

    /// Device the model's weights live on.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Embed mono 16 kHz `samples` into a `frames × dim` matrix.
    fn encode(&self, samples: &[f32]) -> Result<Array2<f32>>;
}

/// One embedding row per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEmbeddingSequence {
    pub hop_size: usize,
    /// `frames × dim`.
    pub features: Array2<f32>,
}

impl ContentEmbeddingSequence {
    pub fn new(hop_size: usize, features: Array2<f32>) -> Self {
        Self { hop_size, features }
    }

    pub fn empty(hop_size: usize, dim: usize) -> Self {
        Self::new(hop_size, Array2::zeros((0, dim)))
    }

    pub fn frames(&self) -> usize {
        self.features.nrows()
    }

    pub fn dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Keep the first `frames` rows.
    pub fn truncate(&mut self, frames: usize) {
        if frames < self.frames() {
            self.features = self
                .features
                .slice_axis(Axis(0), Slice::from(..frames))
                .to_owned();
        }
    }

    /// Repeat every row `factor` times (nearest-neighbour upsampling in time).
    pub fn upsample(&self, factor: usize) -> Self {
        if factor <= 1 {
            return self.clone();
        }
        let (frames, dim) = self.features.dim();
        let mut out = Array2::<f32>::zeros((frames * factor, dim));
        for (i, row) in self.features.outer_iter().enumerate() {
            for k in 0..factor {
                out.row_mut(i * factor + k).assign(&row);
            }
        }
        Self::new(self.hop_size / factor, out)
    }

    /// Bring the row count to exactly `frames`: drop extra rows or repeat
    /// the last row (zeros when there is none).
    fn fit_to(&mut self, frames: usize) {
        let have = self.frames();
        if have >= frames {
            self.truncate(frames);
            return;
        }
        let dim = self.dim();
        let mut out = Array2::<f32>::zeros((frames, dim));
        out.slice_axis_mut(Axis(0), Slice::from(..have))
            .assign(&self.features);
        if have > 0 {
            let last = self.features.row(have - 1).to_owned();
            for i in have..frames {
                out.row_mut(i).assign(&last);
            }
        }
        self.features = out;
    }
}

/// Shared, read-only handle to a loaded content model.
#[derive(Clone, Default)]
pub struct ContentEncoder {
    model: Option<Arc<dyn ContentModel>>,
}

impl ContentEncoder {
    pub fn new(model: Arc<dyn ContentModel>) -> Self {
        Self { model: Some(model) }
    }

    /// An encoder with no model; every `encode` fails with `VcError::Model`.
    pub fn unloaded() -> Self {
        Self { model: None }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn dim(&self) -> Option<usize> {
        self.model.as_ref().map(|m| m.dim())
    }

    pub fn device(&self) -> Option<Device> {
        self.model.as_ref().map(|m| m.device())
    }

    /// Embed `buffer`, returning exactly `floor(len / FRAME_HOP)` frames at
    /// 16 kHz.
    ///
    /// # Errors
    /// - `VcError::Model` if no model is loaded or the model's output shape is
    ///   inconsistent with its declared hop/dim.
    /// - `VcError::Alignment` if the model's frame count misses the grid by
    ///   more than [`FRAME_TOLERANCE`].
    pub fn encode(&self, buffer: &AudioBuffer) -> Result<ContentEmbeddingSequence> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| VcError::Model("content encoder model is not loaded".into()))?;

        let native_hop = model.hop_size();
        if native_hop == 0 || native_hop % FRAME_HOP != 0 {
            return Err(VcError::Model(format!(
                "content model hop {native_hop} is not a multiple of {FRAME_HOP}"
            )));
        }

        let mono = buffer.to_mono();
        let input = if mono.sample_rate == MODEL_SAMPLE_RATE {
            mono
        } else {
            resample(&mono, MODEL_SAMPLE_RATE)?
        };

        let expected = input.samples.len() / FRAME_HOP;
        if expected == 0 {
            return Ok(ContentEmbeddingSequence::empty(FRAME_HOP, model.dim()));
        }

        let raw = model.encode(&input.samples)?;
        if raw.ncols() != model.dim() {
            return Err(VcError::Model(format!(
                "content model returned width {}, declared {}",
                raw.ncols(),
                model.dim()
            )));
        }
        trace!(raw_frames = raw.nrows(), native_hop, "content model output");

        let mut seq =
            ContentEmbeddingSequence::new(native_hop, raw).upsample(native_hop / FRAME_HOP);
        let got = seq.frames();
        if got.abs_diff(expected) > FRAME_TOLERANCE {
            return Err(VcError::Alignment {
                what: "content embeddings",
                got,
                expected,
            });
        }
        if got != expected {
            debug!(got, expected, "fitting content frames to hop grid");
            seq.fit_to(expected);
        }
        Ok(seq)
    }
}

impl fmt::Debug for ContentEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentEncoder")
            .field("loaded", &self.is_loaded())
            .field("dim", &self.dim())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits `len / hop + extra` rows of `[frame_index; dim]`.
    struct CountingModel {
        hop: usize,
        dim: usize,
        extra: isize,
    }

    impl ContentModel for CountingModel {
        fn hop_size(&self) -> usize {
            self.hop
        }

        fn dim(&self) -> usize {
            self.dim
        }

        fn encode(&self, samples: &[f32]) -> Result<Array2<f32>> {
            let frames = (samples.len() / self.hop) as isize + self.extra;
            let frames = frames.max(0) as usize;
            Ok(Array2::from_shape_fn((frames, self.dim), |(i, _)| i as f32))
        }
    }

    fn encoder(hop: usize, extra: isize) -> ContentEncoder {
        ContentEncoder::new(Arc::new(CountingModel { hop, dim: 4, extra }))
    }

    #[test]
    fn unloaded_encoder_is_model_error() {
        let buf = AudioBuffer::mono(vec![0.0; 1_600], 16_000);
        let err = ContentEncoder::unloaded().encode(&buf).unwrap_err();
        assert!(matches!(err, VcError::Model(_)));
    }

    #[test]
    fn frame_count_is_floor_of_len_over_hop() {
        let buf = AudioBuffer::mono(vec![0.0; 16_159], 16_000);
        let seq = encoder(160, 0).encode(&buf).unwrap();
        assert_eq!(seq.frames(), 100);
        assert_eq!(seq.dim(), 4);
    }

    #[test]
    fn coarse_model_is_upsampled() {
        let buf = AudioBuffer::mono(vec![0.0; 3_200], 16_000);
        let seq = encoder(320, 0).encode(&buf).unwrap();
        assert_eq!(seq.frames(), 20);
        assert_eq!(seq.features[[0, 0]], 0.0);
        assert_eq!(seq.features[[1, 0]], 0.0);
        assert_eq!(seq.features[[2, 0]], 1.0);
    }

    #[test]
    fn off_by_one_is_fitted() {
        let buf = AudioBuffer::mono(vec![0.0; 1_600], 16_000);
        let short = encoder(160, -1).encode(&buf).unwrap();
        assert_eq!(short.frames(), 10);
        assert_eq!(short.features[[9, 0]], 8.0, "last row repeated");

        let long = encoder(160, 1).encode(&buf).unwrap();
        assert_eq!(long.frames(), 10);
        assert_eq!(long.features[[9, 0]], 9.0, "leading rows kept");
    }

    #[test]
    fn large_mismatch_is_alignment_error() {
        let buf = AudioBuffer::mono(vec![0.0; 1_600], 16_000);
        let err = encoder(160, -5).encode(&buf).unwrap_err();
        assert!(matches!(err, VcError::Alignment { .. }), "got {err:?}");
    }

    #[test]
    fn other_rates_are_resampled_first() {
        let buf = AudioBuffer::mono(vec![0.0; 48_000], 48_000);
        let seq = encoder(160, 0).encode(&buf).unwrap();
        assert_eq!(seq.frames(), 100);
    }

    #[test]
    fn shorter_than_one_hop_is_empty() {
        let buf = AudioBuffer::mono(vec![0.0; 100], 16_000);
        let seq = encoder(160, 0).encode(&buf).unwrap();
        assert!(seq.is_empty());
        assert_eq!(seq.dim(), 4);
    }
}
