//! ONNX Runtime backends (feature `onnx`).
//!
//! | Backend | Trait | Export |
//! |---------|-------|--------|
//! | [`OnnxContentModel`] | `ContentModel` | HuBERT / ContentVec (`vec-768-layer-12.onnx`) |
//! | [`OnnxPitchModel`] | `PitchEstimator` | RMVPE (`rmvpe.onnx`) |
//! | [`OnnxVocoder`] | `Vocoder` | RVC v1/v2 synthesizer |
//!
//! `ort::Session::run` needs `&mut self`, while the pipeline shares models
//! read-only across chunk workers, so every session sits behind a
//! `parking_lot::Mutex`. Device-level concurrency is still governed by the
//! engine's `DeviceContext`.

pub mod hubert;
pub mod rmvpe;
pub mod session;
pub mod synthesizer;

pub use hubert::{OnnxContentConfig, OnnxContentModel};
pub use rmvpe::OnnxPitchModel;
pub use synthesizer::{OnnxVocoder, OnnxVocoderConfig};
