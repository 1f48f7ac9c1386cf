//! Job progress events broadcast by `ConversionEngine`.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` (camelCase
//! fields, lowercase enum tags) so front-ends can forward them verbatim as
//! JSON.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// One event in a job's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Engine-assigned job id, unique per engine instance.
    pub job_id: u64,
    /// Monotonically increasing event sequence number (engine-wide).
    pub seq: u64,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum JobEventKind {
    StateChanged { state: JobState },
    /// A worker picked up chunk `index`.
    #[serde(rename_all = "camelCase")]
    ChunkStarted { index: usize, total: usize },
    /// Chunk `index` finished inference. Arrives in completion order, not
    /// index order.
    #[serde(rename_all = "camelCase")]
    ChunkCompleted { index: usize, total: usize },
    /// Output is complete (and written, for file jobs).
    #[serde(rename_all = "camelCase")]
    Finished { output_samples: usize, sample_rate: u32 },
    Failed { kind: ErrorKind, message: String },
}

/// Orchestrator state machine.
///
/// ```text
/// Idle → Chunking → Inference → Merging → Done
///   └──────────┴──────────┴─────────┴──► Failed | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Chunking,
    Inference,
    Merging,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}
