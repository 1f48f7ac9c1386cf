//! Compute-device selection and the per-device execution gate.
//!
//! Model calls (content encoding, neural pitch, synthesis) go through
//! [`DeviceContext::run`], which holds one of a fixed number of stream
//! permits for the duration of the call. An accelerator that only supports a
//! single kernel stream is configured with one permit, so device-bound work is
//! serialised while CPU-side pre/post-processing keeps running in parallel on
//! the other workers.

use std::fmt;
use std::str::FromStr;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::VcError;

/// Compute target for model inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Accelerator => "accelerator",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = VcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "accelerator" | "gpu" | "dml" | "directml" => Ok(Device::Accelerator),
            other => Err(VcError::UnsupportedMethod(format!(
                "unknown device target '{other}'"
            ))),
        }
    }
}

/// Counting gate in front of one compute device.
///
/// Shared (behind `Arc`) by every job that targets the device.
pub struct DeviceContext {
    device: Device,
    streams: usize,
    in_use: Mutex<usize>,
    released: Condvar,
}

impl DeviceContext {
    /// `streams` is clamped to at least 1.
    pub fn new(device: Device, streams: usize) -> Self {
        Self {
            device,
            streams: streams.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn streams(&self) -> usize {
        self.streams
    }

    /// Run `f` while holding one stream permit. Blocks until a permit frees up.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.acquire();
        f()
    }

    fn acquire(&self) -> StreamPermit<'_> {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.streams {
            trace!(device = %self.device, "waiting for device stream");
            self.released.wait(&mut in_use);
        }
        *in_use += 1;
        StreamPermit { ctx: self }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

struct StreamPermit<'a> {
    ctx: &'a DeviceContext,
}

impl Drop for StreamPermit<'_> {
    fn drop(&mut self) {
        let mut in_use = self.ctx.in_use.lock();
        *in_use -= 1;
        self.ctx.released.notify_one();
    }
}
