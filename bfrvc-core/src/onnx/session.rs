//! Session construction shared by every ONNX backend.
//!
//! ## Environment overrides
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BFRVC_ORT_INTRA_THREADS` | logical cores, clamped to 2..=12 (4..=12 on the accelerator) |
//! | `BFRVC_ORT_INTER_THREADS` | 1 (2 on the accelerator) |

use std::path::Path;

use ort::{
    ep,
    session::builder::{GraphOptimizationLevel, SessionBuilder},
    session::Session,
};
use tracing::info;

use crate::device::Device;
use crate::error::{Result, VcError};

/// Map any ort failure to a model error.
pub(crate) fn ort_err(e: impl std::fmt::Display) -> VcError {
    VcError::Model(e.to_string())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Build a session for `model_path` with the execution provider for `device`.
///
/// # Errors
/// - `VcError::Model` if the file is missing or ONNX Runtime rejects it.
/// - `VcError::UnsupportedMethod` for `Device::Accelerator` on hosts without
///   DirectML.
pub fn create_session(model_path: &Path, device: Device) -> Result<Session> {
    if !model_path.exists() {
        return Err(VcError::Model(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }
    let accelerated = device == Device::Accelerator;
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let default_intra = if accelerated {
        logical_cores.clamp(4, 12)
    } else {
        logical_cores.clamp(2, 12)
    };
    let intra_threads = env_usize("BFRVC_ORT_INTRA_THREADS")
        .unwrap_or(default_intra)
        .clamp(1, 32);
    let inter_threads = env_usize("BFRVC_ORT_INTER_THREADS")
        .unwrap_or(if accelerated { 2 } else { 1 })
        .clamp(1, 8);

    let builder = SessionBuilder::new()
        .map_err(ort_err)?
        .with_intra_threads(intra_threads)
        .map_err(ort_err)?
        .with_inter_threads(inter_threads)
        .map_err(ort_err)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(ort_err)?;
    info!(
        model = %model_path.display(),
        %device,
        intra_threads,
        inter_threads,
        "ONNX session threading configured"
    );

    let builder = match device {
        Device::Cpu => builder
            .with_execution_providers([ep::CPU::default().build()])
            .map_err(ort_err)?,
        Device::Accelerator => with_accelerator(builder)?,
    };

    builder.commit_from_file(model_path).map_err(ort_err)
}

#[cfg(target_os = "windows")]
fn with_accelerator(builder: SessionBuilder) -> Result<SessionBuilder> {
    builder
        .with_execution_providers([ep::DirectML::default()
            .with_device_id(0)
            .build()
            .error_on_failure()])
        .map_err(ort_err)
}

#[cfg(not(target_os = "windows"))]
fn with_accelerator(_builder: SessionBuilder) -> Result<SessionBuilder> {
    Err(VcError::UnsupportedMethod(
        "accelerator device requires DirectML (Windows)".into(),
    ))
}

/// Input and output names of `session`.
pub(crate) fn io_names(session: &Session) -> (Vec<String>, Vec<String>) {
    let inputs = session
        .inputs()
        .iter()
        .map(|outlet| outlet.name().to_string())
        .collect();
    let outputs = session
        .outputs()
        .iter()
        .map(|outlet| outlet.name().to_string())
        .collect();
    (inputs, outputs)
}

/// First of `preferred` present in `candidates` (case-insensitive).
pub(crate) fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}

/// `resolve_name`, falling back to the tensor at `position`.
pub(crate) fn resolve_or_position(
    candidates: &[String],
    preferred: &[&str],
    position: usize,
    what: &str,
) -> Result<String> {
    resolve_name(candidates, preferred)
        .or_else(|| candidates.get(position).cloned())
        .ok_or_else(|| VcError::Model(format!("model has no {what} tensor")))
}
