//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Input files arrive at any rate (44.1/48 kHz are common); the content and
//! pitch models need 16 kHz, and callers may ask for the vocoder output at yet
//! another rate. [`ChannelResampler`] wraps one mono rubato session (none at
//! all when the rates match); [`resample`] runs one per channel over a whole
//! buffer.
//!
//! Whole-buffer conversion compensates the resampler's output delay and cuts
//! the result to `round(len * target / source)` samples, so durations survive
//! a round trip within rounding and identical input always yields identical
//! output.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::audio::AudioBuffer;
use crate::error::{Result, VcError};

/// Input frames per rubato call.
pub const RESAMPLE_CHUNK: usize = 1024;

/// One mono rubato session, fed in arbitrary-sized pieces.
pub struct ChannelResampler {
    /// Session plus its `[1][output_frames_max]` scratch; `None` when the
    /// rates match.
    session: Option<(FastFixedIn<f32>, Vec<Vec<f32>>)>,
    /// Input not yet handed to rubato (always shorter than `block`).
    pending: Vec<f32>,
    /// Input frames per rubato call.
    block: usize,
}

impl ChannelResampler {
    /// # Errors
    /// `VcError::InvalidConfig` for a zero rate; `VcError::Other` if rubato
    /// rejects the ratio or block size.
    pub fn new(source_rate: u32, target_rate: u32, block: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(VcError::InvalidConfig(format!(
                "cannot resample {source_rate} Hz -> {target_rate} Hz"
            )));
        }
        let session = if source_rate == target_rate {
            None
        } else {
            let engine = FastFixedIn::<f32>::new(
                target_rate as f64 / source_rate as f64,
                1.0,
                PolynomialDegree::Cubic,
                block,
                1,
            )
            .map_err(|e| VcError::Other(anyhow::anyhow!("resampler init: {e}")))?;
            let scratch = vec![vec![0f32; engine.output_frames_max()]];
            debug!(source_rate, target_rate, block, "resampler ready");
            Some((engine, scratch))
        };
        Ok(Self {
            session,
            pending: Vec::new(),
            block,
        })
    }

    /// Feed `samples`; returns whatever output whole blocks produced. A
    /// partial block waits for the next call.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some((engine, scratch)) = self.session.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.block {
            let block = &self.pending[offset..offset + self.block];
            let (_, produced) = engine
                .process_into_buffer(&[block], scratch, None)
                .map_err(|e| VcError::Other(anyhow::anyhow!("resampler process: {e}")))?;
            out.extend_from_slice(&scratch[0][..produced]);
            offset += self.block;
        }
        self.pending.drain(..offset);
        Ok(out)
    }

    /// Leading output samples that precede the first input sample.
    pub fn output_delay(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |(engine, _)| engine.output_delay())
    }

    pub fn is_identity(&self) -> bool {
        self.session.is_none()
    }
}

/// Resample one mono channel to exactly `round(len * target / source)` samples.
pub fn resample_mono(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    let mut rc = ChannelResampler::new(source_rate, target_rate, RESAMPLE_CHUNK)?;
    if rc.is_identity() {
        return Ok(samples.to_vec());
    }

    let expected =
        (samples.len() as f64 * target_rate as f64 / source_rate as f64).round() as usize;
    if expected == 0 {
        return Ok(Vec::new());
    }
    let delay = rc.output_delay();

    let mut out = rc.push(samples)?;
    // Flush with silence until the delayed tail has come through.
    let silence = vec![0f32; RESAMPLE_CHUNK];
    while out.len() < delay + expected {
        let more = rc.push(&silence)?;
        if more.is_empty() {
            break;
        }
        out.extend_from_slice(&more);
    }

    let start = delay.min(out.len());
    let mut trimmed = out[start..].to_vec();
    trimmed.resize(expected, 0.0);
    Ok(trimmed)
}

/// Resample every channel of `buffer` to `target_rate`.
///
/// Channel count is preserved; per-channel length becomes
/// `round(frames * target_rate / sample_rate)`.
pub fn resample(buffer: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    if buffer.sample_rate == target_rate {
        return Ok(buffer.clone());
    }
    debug!(
        from = buffer.sample_rate,
        to = target_rate,
        channels = buffer.channels,
        frames = buffer.frames(),
        "resampling buffer"
    );
    if buffer.channels <= 1 {
        let samples = resample_mono(&buffer.samples, buffer.sample_rate, target_rate)?;
        return Ok(AudioBuffer::mono(samples, target_rate));
    }
    let planes = buffer
        .deinterleave()
        .iter()
        .map(|plane| resample_mono(plane, buffer.sample_rate, target_rate))
        .collect::<Result<Vec<_>>>()?;
    Ok(AudioBuffer::interleave(&planes, target_rate))
}
