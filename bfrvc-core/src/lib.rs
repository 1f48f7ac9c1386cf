//! # bfrvc-core
//!
//! Reusable voice-conversion inference SDK.
//!
//! ## Architecture
//!
//! ```text
//! file → AudioIO::load → condition (mono, 16 kHz) → ChunkPlan
//!                                                      │
//!                              orchestrator workers (std::thread::scope)
//!                                                      │
//!        ┌──────────────── per chunk ─────────────────┐
//!        │ PitchExtractor ∥ ContentEncoder             │
//!        │        └─► RetrievalIndex::refine/protect   │
//!        │                 └─► SynthesisEngine         │
//!        └─────────────────────────────────────────────┘
//!                                                      │
//!                     ordered crossfade merge → AudioIO::write
//!                                                      │
//!                           broadcast::Sender<JobEvent>
//! ```
//!
//! Every model backend sits behind a trait (`ContentModel`,
//! `PitchEstimator`, `NeighborSearch`, `Vocoder`). The weight-free backends
//! ([`content::SpectralContentModel`], [`synthesis::HarmonicVocoder`]) ship by
//! default; ONNX Runtime backends are behind the `onnx` feature.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod config;
pub mod content;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod pitch;
pub mod retrieval;
pub mod synthesis;

#[cfg(feature = "onnx")]
pub mod onnx;

/// Sample rate every model-side stage runs at.
pub const MODEL_SAMPLE_RATE: u32 = 16_000;
/// Samples per analysis frame at [`MODEL_SAMPLE_RATE`] (10 ms).
pub const FRAME_HOP: usize = 160;
/// Frame-count mismatch between pitch and content absorbed by truncation.
pub const FRAME_TOLERANCE: usize = 2;

// Convenience re-exports for downstream crates
pub use audio::{AudioBuffer, OutputFormat};
pub use config::ConversionConfig;
pub use content::{ContentEmbeddingSequence, ContentEncoder, ContentModel};
pub use device::Device;
pub use engine::{CancellationToken, ConversionEngine, CrossfadeCurve, JobReport, ModelSet};
pub use error::{ErrorKind, Result, VcError};
pub use events::{JobEvent, JobEventKind, JobState};
pub use pitch::{F0Method, PitchContour, PitchEstimator, PitchExtractor};
pub use retrieval::{FlatIndex, NeighborSearch};
pub use synthesis::{SpeakerBank, SpeakerEmbedding, SynthesisEngine, Vocoder};

#[cfg(feature = "onnx")]
pub use onnx::{
    OnnxContentConfig, OnnxContentModel, OnnxPitchModel, OnnxVocoder, OnnxVocoderConfig,
};
