//! Per-job conversion options.
//!
//! `ConversionConfig` is deserialised from JSON with `#[serde(default)]`, so a
//! settings file only needs the fields it overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    audio::io::OutputFormat,
    device::Device,
    engine::chunking::CrossfadeCurve,
    error::{Result, VcError},
    pitch::F0Method,
};

/// Upper bound for the default worker count.
const MAX_DEFAULT_WORKERS: usize = 8;
/// Longest accepted chunk: one day of audio.
const MAX_CHUNK_SECONDS: f32 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Pitch estimation strategy.
    pub f0_method: F0Method,
    /// Transposition applied to voiced frames, in semitones.
    pub pitch_shift_semitones: i32,
    /// Blend between original content (0.0) and index neighbours (1.0).
    pub retrieval_ratio: f32,
    /// Neighbours averaged per frame during retrieval.
    pub retrieval_k: usize,
    /// Pull unvoiced frames back toward their pre-retrieval features.
    /// `>= 0.5` disables protection.
    pub protect: f32,
    /// Median smoothing radius for the pitch contour; active when `>= 3`.
    pub filter_radius: usize,
    /// 0.0 imposes the input loudness envelope, 1.0 keeps the vocoder's.
    pub rms_mix_rate: f32,
    pub chunk_length_seconds: f32,
    /// Overlap between consecutive chunks; also the crossfade length.
    pub crossfade_seconds: f32,
    pub crossfade_curve: CrossfadeCurve,
    pub device: Device,
    /// Concurrent kernel streams allowed on the accelerator.
    pub accelerator_streams: usize,
    /// Chunk worker threads.
    pub workers: usize,
    /// Target speaker, looked up in the model set's speaker bank.
    pub speaker_id: u32,
    /// Input high-pass cutoff; `None` disables the filter.
    pub highpass_hz: Option<f32>,
    /// Resample the result to this rate; `None` keeps the vocoder rate.
    pub output_sample_rate: Option<u32>,
    pub output_format: OutputFormat,
    /// Seed for any noise a synthesizer backend consumes.
    pub seed: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            f0_method: F0Method::Yin,
            pitch_shift_semitones: 0,
            retrieval_ratio: 0.75,
            retrieval_k: 8,
            protect: 0.33,
            filter_radius: 3,
            rms_mix_rate: 1.0,
            chunk_length_seconds: 10.0,
            crossfade_seconds: 0.5,
            crossfade_curve: CrossfadeCurve::Linear,
            device: Device::Cpu,
            accelerator_streams: 1,
            workers: default_workers(),
            speaker_id: 0,
            highpass_hz: Some(48.0),
            output_sample_rate: None,
            output_format: OutputFormat::Pcm16,
            seed: 0,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(1, MAX_DEFAULT_WORKERS)
}

impl ConversionConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| VcError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject option combinations no job can run with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval_ratio) {
            return Err(VcError::InvalidConfig(format!(
                "retrieval_ratio must be in [0, 1], got {}",
                self.retrieval_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.rms_mix_rate) {
            return Err(VcError::InvalidConfig(format!(
                "rms_mix_rate must be in [0, 1], got {}",
                self.rms_mix_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.protect) {
            return Err(VcError::InvalidConfig(format!(
                "protect must be in [0, 1], got {}",
                self.protect
            )));
        }
        if self.retrieval_k == 0 {
            return Err(VcError::InvalidConfig("retrieval_k must be > 0".into()));
        }
        if !self.chunk_length_seconds.is_finite()
            || self.chunk_length_seconds <= 0.0
            || self.chunk_length_seconds > MAX_CHUNK_SECONDS
        {
            return Err(VcError::InvalidConfig(format!(
                "chunk_length_seconds must be in (0, {MAX_CHUNK_SECONDS}], got {}",
                self.chunk_length_seconds
            )));
        }
        if !self.crossfade_seconds.is_finite()
            || self.crossfade_seconds < 0.0
            || self.crossfade_seconds >= self.chunk_length_seconds
        {
            return Err(VcError::InvalidConfig(format!(
                "crossfade_seconds must be in [0, chunk_length_seconds), got {}",
                self.crossfade_seconds
            )));
        }
        if self.workers == 0 {
            return Err(VcError::InvalidConfig("workers must be > 0".into()));
        }
        if let Some(hz) = self.highpass_hz {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(VcError::InvalidConfig(format!(
                    "highpass_hz must be positive, got {hz}"
                )));
            }
        }
        if self.output_sample_rate == Some(0) {
            return Err(VcError::InvalidConfig(
                "output_sample_rate must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ConversionConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ConversionConfig::from_json_str(
            r#"{ "f0_method": "acf", "pitch_shift_semitones": -5, "device": "accelerator" }"#,
        )
        .unwrap();
        assert_eq!(config.f0_method, F0Method::Acf);
        assert_eq!(config.pitch_shift_semitones, -5);
        assert_eq!(config.device, Device::Accelerator);
        assert_eq!(config.retrieval_k, 8);
        assert_eq!(config.crossfade_curve, CrossfadeCurve::Linear);
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        let config = ConversionConfig {
            retrieval_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VcError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_overlap_not_shorter_than_chunk() {
        let config = ConversionConfig {
            chunk_length_seconds: 1.0,
            crossfade_seconds: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VcError::InvalidConfig(_))));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = ConversionConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, VcError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_chunks_longer_than_a_day() {
        let config = ConversionConfig {
            chunk_length_seconds: 1e16,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(VcError::InvalidConfig(_))));
        let config = ConversionConfig {
            chunk_length_seconds: 86_400.0,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
