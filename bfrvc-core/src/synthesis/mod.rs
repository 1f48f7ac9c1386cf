//! Waveform synthesis.
//!
//! The `Vocoder` trait decouples the pipeline from any specific backend
//! (built-in harmonic source-filter, ONNX RVC synthesizer, …). Vocoders are
//! read-only at inference time, so one instance serves every chunk worker.
//!
//! `SynthesisEngine` owns the alignment contract between embeddings and the
//! pitch contour and fixes the output length at `frames * hop` samples.

pub mod harmonic;

pub use harmonic::HarmonicVocoder;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayView2, Axis, Slice};
use tracing::debug;

use crate::audio::AudioBuffer;
use crate::content::ContentEmbeddingSequence;
use crate::device::Device;
use crate::error::{Result, VcError};
use crate::pitch::PitchContour;
use crate::FRAME_TOLERANCE;

/// Target voice: numeric id (RVC `sid`) plus an optional timbre vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerEmbedding {
    pub id: u32,
    pub vector: Vec<f32>,
}

impl SpeakerEmbedding {
    pub fn new(id: u32, vector: Vec<f32>) -> Self {
        Self { id, vector }
    }

    /// A speaker known only by id.
    pub fn id_only(id: u32) -> Self {
        Self::new(id, Vec::new())
    }
}

/// Speaker table, loaded once and shared read-only by all chunks of a job.
#[derive(Debug, Clone, Default)]
pub struct SpeakerBank {
    speakers: HashMap<u32, SpeakerEmbedding>,
}

impl SpeakerBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a speaker.
    pub fn insert(&mut self, speaker: SpeakerEmbedding) {
        self.speakers.insert(speaker.id, speaker);
    }

    pub fn with(mut self, speaker: SpeakerEmbedding) -> Self {
        self.insert(speaker);
        self
    }

    /// # Errors
    /// `VcError::Model` for an unknown id.
    pub fn get(&self, id: u32) -> Result<&SpeakerEmbedding> {
        self.speakers
            .get(&id)
            .ok_or_else(|| VcError::Model(format!("unknown speaker id {id}")))
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }
}

impl FromIterator<SpeakerEmbedding> for SpeakerBank {
    fn from_iter<I: IntoIterator<Item = SpeakerEmbedding>>(iter: I) -> Self {
        let mut bank = Self::new();
        for speaker in iter {
            bank.insert(speaker);
        }
        bank
    }
}

/// Frame-aligned synthesis inputs. `features` and `pitch` always have the
/// same number of frames when a vocoder sees them.
pub struct SynthesisRequest<'a> {
    /// `frames × dim` content features on the 16 kHz / 160-sample grid.
    pub features: ArrayView2<'a, f32>,
    /// Hz per frame, 0 for unvoiced.
    pub pitch: &'a [f32],
    pub speaker: &'a SpeakerEmbedding,
    /// Seed for any noise input the backend needs.
    pub seed: u64,
}

impl SynthesisRequest<'_> {
    pub fn frames(&self) -> usize {
        self.pitch.len()
    }
}

/// Contract for waveform generators.
pub trait Vocoder: Send + Sync {
    /// Output sample rate.
    fn sample_rate(&self) -> u32;

    /// Output samples per input frame.
    fn hop_size(&self) -> usize;

    /// Device the model's weights live on.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Render `request` to mono samples. The engine pads or trims the result
    /// to `frames * hop_size`.
    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Vec<f32>>;
}

/// Shared, read-only handle to a loaded vocoder.
#[derive(Clone, Default)]
pub struct SynthesisEngine {
    vocoder: Option<Arc<dyn Vocoder>>,
}

impl SynthesisEngine {
    pub fn new(vocoder: Arc<dyn Vocoder>) -> Self {
        Self {
            vocoder: Some(vocoder),
        }
    }

    pub fn unloaded() -> Self {
        Self { vocoder: None }
    }

    pub fn is_loaded(&self) -> bool {
        self.vocoder.is_some()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.vocoder.as_ref().map(|v| v.sample_rate())
    }

    pub fn hop_size(&self) -> Option<usize> {
        self.vocoder.as_ref().map(|v| v.hop_size())
    }

    pub fn device(&self) -> Option<Device> {
        self.vocoder.as_ref().map(|v| v.device())
    }

    /// Render `embeddings` with `pitch` in the voice of `speaker`.
    ///
    /// # Errors
    /// - `VcError::Model` if no vocoder is loaded.
    /// - `VcError::Alignment` if the frame counts differ by more than
    ///   [`FRAME_TOLERANCE`]; smaller differences are truncated away.
    pub fn synthesize(
        &self,
        embeddings: &ContentEmbeddingSequence,
        pitch: &PitchContour,
        speaker: &SpeakerEmbedding,
        seed: u64,
    ) -> Result<AudioBuffer> {
        let vocoder = self
            .vocoder
            .as_ref()
            .ok_or_else(|| VcError::Model("vocoder model is not loaded".into()))?;

        let (e, p) = (embeddings.frames(), pitch.len());
        if e.abs_diff(p) > FRAME_TOLERANCE {
            return Err(VcError::Alignment {
                what: "pitch contour",
                got: p,
                expected: e,
            });
        }
        let frames = e.min(p);
        if e != p {
            debug!(embeddings = e, pitch = p, frames, "truncating to shorter input");
        }

        let hop = vocoder.hop_size();
        let expected = frames * hop;
        let mut samples = if frames == 0 {
            Vec::new()
        } else {
            let request = SynthesisRequest {
                features: embeddings
                    .features
                    .slice_axis(Axis(0), Slice::from(..frames)),
                pitch: &pitch.values[..frames],
                speaker,
                seed,
            };
            vocoder.synthesize(&request)?
        };
        if samples.len() != expected {
            debug!(got = samples.len(), expected, "fitting vocoder output length");
            samples.resize(expected, 0.0);
        }
        Ok(AudioBuffer::mono(samples, vocoder.sample_rate()))
    }
}

impl fmt::Debug for SynthesisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisEngine")
            .field("sample_rate", &self.sample_rate())
            .field("hop_size", &self.hop_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Emits `frames * hop + extra` samples of the frame's pitch.
    struct EchoVocoder {
        extra: isize,
    }

    impl Vocoder for EchoVocoder {
        fn sample_rate(&self) -> u32 {
            8_000
        }

        fn hop_size(&self) -> usize {
            80
        }

        fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<Vec<f32>> {
            assert_eq!(request.features.nrows(), request.frames());
            let mut out: Vec<f32> = request
                .pitch
                .iter()
                .flat_map(|&f| std::iter::repeat(f).take(80))
                .collect();
            let len = (out.len() as isize + self.extra).max(0) as usize;
            out.resize(len, -1.0);
            Ok(out)
        }
    }

    fn inputs(e: usize, p: usize) -> (ContentEmbeddingSequence, PitchContour) {
        let seq = ContentEmbeddingSequence::new(160, Array2::zeros((e, 3)));
        let pitch = PitchContour {
            sample_rate: 16_000,
            hop_size: 160,
            values: vec![100.0; p],
        };
        (seq, pitch)
    }

    #[test]
    fn unloaded_is_model_error() {
        let (seq, pitch) = inputs(4, 4);
        let err = SynthesisEngine::unloaded()
            .synthesize(&seq, &pitch, &SpeakerEmbedding::id_only(0), 0)
            .unwrap_err();
        assert!(matches!(err, VcError::Model(_)));
    }

    #[test]
    fn output_length_is_frames_times_hop() {
        let engine = SynthesisEngine::new(Arc::new(EchoVocoder { extra: 7 }));
        let (seq, pitch) = inputs(10, 10);
        let out = engine
            .synthesize(&seq, &pitch, &SpeakerEmbedding::id_only(0), 0)
            .unwrap();
        assert_eq!(out.samples.len(), 800);
        assert_eq!(out.sample_rate, 8_000);

        let engine = SynthesisEngine::new(Arc::new(EchoVocoder { extra: -30 }));
        let out = engine
            .synthesize(&seq, &pitch, &SpeakerEmbedding::id_only(0), 0)
            .unwrap();
        assert_eq!(out.samples.len(), 800);
    }

    #[test]
    fn small_mismatch_truncates_to_shorter() {
        let engine = SynthesisEngine::new(Arc::new(EchoVocoder { extra: 0 }));
        let (seq, pitch) = inputs(10, 9);
        let out = engine
            .synthesize(&seq, &pitch, &SpeakerEmbedding::id_only(0), 0)
            .unwrap();
        assert_eq!(out.samples.len(), 9 * 80);
    }

    #[test]
    fn large_mismatch_is_alignment_error() {
        let engine = SynthesisEngine::new(Arc::new(EchoVocoder { extra: 0 }));
        let (seq, pitch) = inputs(10, 4);
        let err = engine
            .synthesize(&seq, &pitch, &SpeakerEmbedding::id_only(0), 0)
            .unwrap_err();
        assert!(matches!(err, VcError::Alignment { .. }));
    }

    #[test]
    fn speaker_bank_lookup() {
        let bank: SpeakerBank = [SpeakerEmbedding::new(3, vec![0.5])].into_iter().collect();
        assert_eq!(bank.get(3).unwrap().vector, vec![0.5]);
        assert!(matches!(bank.get(4), Err(VcError::Model(_))));
    }
}
