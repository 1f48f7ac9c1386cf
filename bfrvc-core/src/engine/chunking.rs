//! Chunk planning and ordered, crossfaded merging.
//!
//! ## Layout
//!
//! ```text
//! input   |-------- chunk 0 --------|
//!                            |-------- chunk 1 --------|
//!                                               |---- chunk 2 ----|
//!                            ^^^^^^^ overlap    ^^^^^^^
//! ```
//!
//! Window and overlap are rounded to whole frames, so every chunk start is on
//! the frame grid and chunk `i`'s output lands at `start / hop * out_hop`.
//! Summing the chunks therefore reproduces the unchunked frame count exactly.

use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VcError};

/// Gain curve used across chunk overlaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossfadeCurve {
    /// `t` / `1 − t`.
    #[default]
    Linear,
    /// `sin` / `cos` quarter wave; constant power for uncorrelated signals.
    EqualPower,
}

impl CrossfadeCurve {
    /// `(fade_out, fade_in)` gains at position `t ∈ [0, 1]`.
    pub fn gains(self, t: f32) -> (f32, f32) {
        match self {
            CrossfadeCurve::Linear => (1.0 - t, t),
            CrossfadeCurve::EqualPower => ((t * FRAC_PI_2).cos(), (t * FRAC_PI_2).sin()),
        }
    }
}

/// One window of the input, in model-rate samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    /// Samples shared with the previous chunk (0 for the first).
    pub overlap_before: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    hop: usize,
    window: usize,
    overlap: usize,
    total_len: usize,
}

impl ChunkPlan {
    /// Split `total_len` samples into windows of `window` samples sharing
    /// `overlap` samples, both rounded to multiples of `hop`. The last
    /// chunk ends exactly at `total_len`.
    ///
    /// # Errors
    /// `VcError::InvalidConfig` if `hop` is zero or the rounded overlap is
    /// not shorter than the rounded window.
    pub fn new(total_len: usize, window: usize, overlap: usize, hop: usize) -> Result<Self> {
        if hop == 0 {
            return Err(VcError::InvalidConfig("frame hop must be > 0".into()));
        }
        let round = |n: usize| (n.saturating_add(hop / 2) / hop) * hop;
        let window = round(window).max(hop);
        let overlap = round(overlap);
        if overlap >= window {
            return Err(VcError::InvalidConfig(format!(
                "crossfade ({overlap} samples) must be shorter than the chunk ({window} samples)"
            )));
        }
        let step = window - overlap;

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < total_len {
            let index = chunks.len();
            let end = start.saturating_add(window);
            let overlap_before = if index == 0 { 0 } else { overlap };
            if end >= total_len {
                chunks.push(Chunk {
                    index,
                    start,
                    end: total_len,
                    overlap_before,
                });
                break;
            }
            chunks.push(Chunk {
                index,
                start,
                end,
                overlap_before,
            });
            start += step;
        }

        Ok(Self {
            chunks,
            hop,
            window,
            overlap,
            total_len,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Frames the whole input yields, chunked or not.
    pub fn total_frames(&self) -> usize {
        self.total_len / self.hop
    }

    /// Position of `chunk`'s first output sample when every input frame
    /// becomes `out_hop` output samples.
    pub fn output_offset(&self, chunk: &Chunk, out_hop: usize) -> usize {
        chunk.start / self.hop * out_hop
    }
}

/// Accumulates chunk outputs in index order, crossfading each overlap.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    samples: Vec<f32>,
    curve: CrossfadeCurve,
}

impl OutputBuffer {
    pub fn new(curve: CrossfadeCurve) -> Self {
        Self::with_capacity(curve, 0)
    }

    pub fn with_capacity(curve: CrossfadeCurve, capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            curve,
        }
    }

    /// Place `data` at `offset`. Samples already present past `offset` are
    /// crossfaded with the head of `data`; the rest is copied.
    pub fn append(&mut self, offset: usize, data: &[f32]) {
        if offset > self.samples.len() {
            self.samples.resize(offset, 0.0);
        }
        let fade = (self.samples.len() - offset).min(data.len());
        for (i, &incoming) in data[..fade].iter().enumerate() {
            let t = (i as f32 + 0.5) / fade as f32;
            let (out_gain, in_gain) = self.curve.gains(t);
            let slot = &mut self.samples[offset + i];
            *slot = *slot * out_gain + incoming * in_gain;
        }
        // A chunk shorter than what is already merged past `offset` leaves
        // the existing tail untouched.
        if offset + data.len() > self.samples.len() {
            self.samples.extend_from_slice(&data[fade..]);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}
