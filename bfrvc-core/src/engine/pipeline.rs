//! Per-chunk inference.
//!
//! ## Stages
//!
//! ```text
//! 1. Slice the conditioned 16 kHz input to the chunk window
//! 2. Pitch extraction ∥ content encoding          (scoped threads)
//! 3. Retrieval refinement + consonant protection  (optional)
//! 4. Synthesis                                    (device-gated)
//! 5. Loudness-envelope mix against the input
//! ```
//!
//! Model calls go through the job's `DeviceContext`; CPU pitch estimators
//! and the pre/post-processing run outside the gate.

use std::sync::atomic::Ordering;

use tracing::{debug, debug_span, trace};

use crate::audio::AudioBuffer;
use crate::config::ConversionConfig;
use crate::content::ContentEncoder;
use crate::device::DeviceContext;
use crate::engine::chunking::Chunk;
use crate::engine::job::JobContext;
use crate::error::{Result, VcError};
use crate::pitch::PitchExtractor;
use crate::retrieval::{self, NeighborSearch};
use crate::synthesis::{SpeakerEmbedding, SynthesisEngine};
use crate::{FRAME_HOP, MODEL_SAMPLE_RATE};

/// Turns one chunk of the input into its share of the output.
///
/// Implementations are shared by all workers of a job.
pub trait ChunkProcessor: Sync {
    /// Output samples per input frame.
    fn output_hop(&self) -> usize;

    fn process(&self, chunk: &Chunk, ctx: &JobContext<'_>) -> Result<Vec<f32>>;
}

/// The conversion pipeline bound to one job's input and models.
pub struct ConversionPipeline<'a> {
    /// Conditioned mono input at [`MODEL_SAMPLE_RATE`].
    pub input: &'a [f32],
    pub content: &'a ContentEncoder,
    pub pitch: PitchExtractor,
    pub index: Option<&'a dyn NeighborSearch>,
    pub synthesis: &'a SynthesisEngine,
    pub speaker: &'a SpeakerEmbedding,
    pub device: &'a DeviceContext,
    /// Vocoder hop in output samples.
    pub output_hop: usize,
}

impl ChunkProcessor for ConversionPipeline<'_> {
    fn output_hop(&self) -> usize {
        self.output_hop
    }

    fn process(&self, chunk: &Chunk, ctx: &JobContext<'_>) -> Result<Vec<f32>> {
        let span = debug_span!("chunk", index = chunk.index, start = chunk.start, end = chunk.end);
        let _guard = span.enter();
        let config = ctx.config;

        let window = AudioBuffer::mono(
            self.input[chunk.start..chunk.end].to_vec(),
            MODEL_SAMPLE_RATE,
        );

        // ── Features ─────────────────────────────────────────────────────────
        let (pitch, embeddings) = std::thread::scope(|s| {
            let pitch_task = s.spawn(|| {
                let extract = || {
                    self.pitch.extract(
                        &window,
                        FRAME_HOP,
                        config.f0_method,
                        config.pitch_shift_semitones,
                    )
                };
                if config.f0_method.is_neural() {
                    self.device.run(extract)
                } else {
                    extract()
                }
            });
            let embeddings = self.device.run(|| self.content.encode(&window));
            let pitch = pitch_task
                .join()
                .map_err(|_| VcError::Other(anyhow::anyhow!("pitch extraction panicked")));
            (pitch, embeddings)
        });
        let pitch = pitch??;
        let embeddings = embeddings?;
        ctx.diagnostics
            .frames_encoded
            .fetch_add(embeddings.frames(), Ordering::Relaxed);
        trace!(
            frames = embeddings.frames(),
            voiced = pitch.voiced_frames(),
            "features ready"
        );

        // ── Retrieval ────────────────────────────────────────────────────────
        let embeddings = match self.index {
            Some(index) if config.retrieval_ratio > 0.0 => {
                let original = embeddings.clone();
                let mut refined = retrieval::refine(
                    embeddings,
                    Some(index),
                    config.retrieval_ratio,
                    config.retrieval_k,
                )?;
                retrieval::protect(&mut refined, &original, &pitch, config.protect)?;
                ctx.diagnostics
                    .frames_refined
                    .fetch_add(refined.frames(), Ordering::Relaxed);
                refined
            }
            _ => embeddings,
        };

        // ── Synthesis ────────────────────────────────────────────────────────
        let seed = chunk_seed(config, chunk.index);
        let mut audio = self
            .device
            .run(|| self.synthesis.synthesize(&embeddings, &pitch, self.speaker, seed))?;
        ctx.diagnostics
            .samples_synthesized
            .fetch_add(audio.samples.len(), Ordering::Relaxed);

        if config.rms_mix_rate < 1.0 {
            mix_loudness(
                &window.samples,
                window.sample_rate,
                &mut audio.samples,
                audio.sample_rate,
                config.rms_mix_rate,
            );
        }

        debug!(samples = audio.samples.len(), "chunk synthesized");
        Ok(audio.samples)
    }
}

/// Per-chunk noise seed: a function of the job seed and the chunk index only,
/// so scheduling never changes the output.
fn chunk_seed(config: &ConversionConfig, index: usize) -> u64 {
    config
        .seed
        .wrapping_add((index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Scale `output` by `rms_in^(1 − rate) · rms_out^(rate − 1)`, with both
/// envelopes measured over half-second hops and interpolated per sample.
pub(crate) fn mix_loudness(
    input: &[f32],
    input_rate: u32,
    output: &mut [f32],
    output_rate: u32,
    rate: f32,
) {
    if output.is_empty() || input.is_empty() {
        return;
    }
    let env_in = rms_envelope(input, input_rate, output.len());
    let env_out = rms_envelope(output, output_rate, output.len());
    for ((s, &a), &b) in output.iter_mut().zip(&env_in).zip(&env_out) {
        *s *= a.powf(1.0 - rate) * b.max(1e-6).powf(rate - 1.0);
    }
}

/// Centred RMS every `rate / 2` samples (window twice the hop), linearly
/// interpolated to `len` points.
fn rms_envelope(samples: &[f32], rate: u32, len: usize) -> Vec<f32> {
    let hop = (rate as usize / 2).max(1);
    let frames = samples.len() / hop + 1;
    let values: Vec<f32> = (0..frames)
        .map(|k| {
            let center = k * hop;
            let lo = center.saturating_sub(hop);
            let hi = (center + hop).min(samples.len());
            let energy: f32 = samples[lo..hi].iter().map(|s| s * s).sum();
            (energy / (2 * hop) as f32).sqrt()
        })
        .collect();

    let scale = frames as f32 / len as f32;
    (0..len)
        .map(|i| {
            let pos = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, (frames - 1) as f32);
            let k = pos.floor() as usize;
            let next = (k + 1).min(frames - 1);
            let frac = pos - k as f32;
            values[k] * (1.0 - frac) + values[next] * frac
        })
        .collect()
}
