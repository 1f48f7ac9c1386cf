//! Per-job state: cancellation, diagnostics, event emission and the final
//! report.
//!
//! Nothing here is global. `ConversionEngine` builds one [`JobContext`] per
//! job and passes it explicitly through the orchestrator and every chunk.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ConversionConfig;
use crate::error::{Result, VcError};
use crate::events::{JobEvent, JobEventKind, JobState};

/// Cooperative cancellation flag shared between the caller and a job.
///
/// Cloning is cheap; every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(VcError::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Engine-wide event fan-out with a shared sequence counter.
#[derive(Debug)]
pub struct EventSink {
    tx: broadcast::Sender<JobEvent>,
    seq: AtomicU64,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, job_id: u64, kind: JobEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.tx.send(JobEvent { job_id, seq, kind });
    }
}

#[derive(Debug, Default)]
pub struct JobDiagnostics {
    pub chunks_planned: AtomicUsize,
    pub chunks_started: AtomicUsize,
    pub chunks_completed: AtomicUsize,
    pub chunks_failed: AtomicUsize,
    pub frames_encoded: AtomicUsize,
    pub frames_refined: AtomicUsize,
    pub samples_synthesized: AtomicUsize,
}

impl JobDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_planned: self.chunks_planned.load(Ordering::Relaxed),
            chunks_started: self.chunks_started.load(Ordering::Relaxed),
            chunks_completed: self.chunks_completed.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_refined: self.frames_refined.load(Ordering::Relaxed),
            samples_synthesized: self.samples_synthesized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub chunks_planned: usize,
    pub chunks_started: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub frames_encoded: usize,
    pub frames_refined: usize,
    pub samples_synthesized: usize,
}

/// Everything a running job needs besides the models.
pub struct JobContext<'a> {
    pub job_id: u64,
    pub config: &'a ConversionConfig,
    pub token: &'a CancellationToken,
    pub diagnostics: JobDiagnostics,
    state: Mutex<JobState>,
    events: &'a EventSink,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job_id: u64,
        config: &'a ConversionConfig,
        token: &'a CancellationToken,
        events: &'a EventSink,
    ) -> Self {
        Self {
            job_id,
            config,
            token,
            diagnostics: JobDiagnostics::default(),
            state: Mutex::new(JobState::Idle),
            events,
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    /// Move to `state` and publish the transition. Terminal states are
    /// sticky.
    pub fn set_state(&self, state: JobState) {
        {
            let mut current = self.state.lock();
            if current.is_terminal() || *current == state {
                return;
            }
            *current = state;
        }
        debug!(job_id = self.job_id, ?state, "job state");
        self.emit(JobEventKind::StateChanged { state });
    }

    pub fn emit(&self, kind: JobEventKind) {
        self.events.emit(self.job_id, kind);
    }

    pub fn chunk_started(&self, index: usize, total: usize) {
        self.diagnostics
            .chunks_started
            .fetch_add(1, Ordering::Relaxed);
        self.emit(JobEventKind::ChunkStarted { index, total });
    }

    pub fn chunk_completed(&self, index: usize, total: usize) {
        self.diagnostics
            .chunks_completed
            .fetch_add(1, Ordering::Relaxed);
        self.emit(JobEventKind::ChunkCompleted { index, total });
    }

    /// Publish the terminal state matching `err` plus the failure event.
    pub fn fail(&self, err: &VcError) {
        let state = if matches!(err, VcError::Cancelled) {
            JobState::Cancelled
        } else {
            JobState::Failed
        };
        info!(job_id = self.job_id, kind = ?err.kind(), error = %err, "job ended without output");
        self.set_state(state);
        self.emit(JobEventKind::Failed {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// Summary of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: u64,
    pub chunks: usize,
    pub input_samples: usize,
    pub input_sample_rate: u32,
    pub output_samples: usize,
    pub output_sample_rate: u32,
    pub elapsed_ms: u64,
    pub diagnostics: DiagnosticsSnapshot,
}

impl JobReport {
    pub fn output_duration(&self) -> Duration {
        if self.output_sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.output_samples as f64 / self.output_sample_rate as f64)
    }
}
