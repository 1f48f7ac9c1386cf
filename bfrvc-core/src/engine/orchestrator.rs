//! Parallel chunk scheduling with an in-order merge.
//!
//! ## Threading
//!
//! ```text
//! dispatcher ──bounded(0)──► worker 0..N ──unbounded──► merger (caller thread)
//! ```
//!
//! The task channel is a rendezvous: a chunk is handed over only when a
//! worker is ready to take it, so the dispatcher's cancellation check
//! happens right before each chunk starts rather than when it was queued.
//! Workers check the token again on pickup. Results arrive in completion
//! order and wait in a reorder buffer until every lower index is merged.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info, warn};

use crate::engine::chunking::{Chunk, ChunkPlan, CrossfadeCurve, OutputBuffer};
use crate::engine::job::JobContext;
use crate::engine::pipeline::ChunkProcessor;
use crate::error::{Result, VcError};
use crate::events::JobState;

/// Run every chunk of `plan` through `processor` on `workers` threads and
/// return the merged output.
///
/// # Errors
/// - `VcError::Chunk` wrapping the first chunk failure; chunks not yet
///   dispatched are never started.
/// - `VcError::Cancelled` if the token fired before all chunks completed.
pub fn run<P: ChunkProcessor>(
    plan: &ChunkPlan,
    processor: &P,
    ctx: &JobContext<'_>,
    workers: usize,
    curve: CrossfadeCurve,
) -> Result<Vec<f32>> {
    let total = plan.len();
    let out_hop = processor.output_hop();
    ctx.diagnostics
        .chunks_planned
        .store(total, Ordering::Relaxed);
    ctx.set_state(JobState::Inference);

    let workers = workers.clamp(1, total.max(1));
    info!(chunks = total, workers, "dispatching chunks");

    let abort = AtomicBool::new(false);
    let mut output = OutputBuffer::with_capacity(curve, plan.total_frames() * out_hop);
    let mut pending: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
    let mut next = 0usize;
    let mut first_error: Option<VcError> = None;

    std::thread::scope(|s| {
        let (task_tx, task_rx) = bounded::<Chunk>(0);
        let (result_tx, result_rx) = unbounded::<(usize, Result<Vec<f32>>)>();

        for worker in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let abort = &abort;
            s.spawn(move || {
                for chunk in task_rx.iter() {
                    if ctx.token.is_cancelled() || abort.load(Ordering::SeqCst) {
                        debug!(worker, index = chunk.index, "skipping chunk");
                        continue;
                    }
                    ctx.chunk_started(chunk.index, total);
                    let result = catch_unwind(AssertUnwindSafe(|| processor.process(&chunk, ctx)))
                        .unwrap_or_else(|_| {
                            Err(VcError::Other(anyhow::anyhow!("chunk worker panicked")))
                        });
                    if result.is_err() {
                        // Stop this worker's next pickup before the merger sees the error.
                        abort.store(true, Ordering::SeqCst);
                    }
                    if result_tx.send((chunk.index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        let abort = &abort;
        s.spawn(move || {
            for chunk in plan.chunks() {
                if ctx.token.is_cancelled() || abort.load(Ordering::SeqCst) {
                    debug!(index = chunk.index, "dispatch stopped");
                    break;
                }
                if task_tx.send(*chunk).is_err() {
                    break;
                }
            }
        });

        for (index, result) in result_rx.iter() {
            match result {
                Ok(samples) => {
                    ctx.chunk_completed(index, total);
                    pending.insert(index, samples);
                    while let Some(samples) = pending.remove(&next) {
                        if next == 0 {
                            ctx.set_state(JobState::Merging);
                        }
                        let chunk = &plan.chunks()[next];
                        output.append(plan.output_offset(chunk, out_hop), &samples);
                        next += 1;
                    }
                }
                Err(err) => {
                    ctx.diagnostics
                        .chunks_failed
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(index, error = %err, "chunk failed");
                    if first_error.is_none() {
                        abort.store(true, Ordering::SeqCst);
                        first_error = Some(VcError::chunk(index, err));
                    }
                }
            }
        }
    });

    if let Some(err) = first_error {
        return Err(err);
    }
    if next < total || ctx.token.is_cancelled() {
        info!(merged = next, total, "job cancelled");
        return Err(VcError::Cancelled);
    }

    // An empty plan merges nothing but still passes through Merging.
    ctx.set_state(JobState::Merging);
    debug!(samples = output.len(), "chunks merged");
    Ok(output.into_samples())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversionConfig;
    use crate::engine::chunking::Chunk;
    use crate::engine::job::{CancellationToken, EventSink};
    use crate::events::JobEventKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Emits `chunk.index + 1` for every output sample; sleeps longer for
    /// early chunks so completions arrive out of order.
    struct IndexProcessor {
        fail_at: Option<usize>,
        cancel_after_first: Option<CancellationToken>,
        calls: AtomicUsize,
    }

    impl IndexProcessor {
        fn new() -> Self {
            Self {
                fail_at: None,
                cancel_after_first: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ChunkProcessor for IndexProcessor {
        fn output_hop(&self) -> usize {
            2
        }

        fn process(&self, chunk: &Chunk, _ctx: &JobContext<'_>) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            if self.fail_at == Some(chunk.index) {
                return Err(VcError::Model("synthetic failure".into()));
            }
            std::thread::sleep(Duration::from_millis(((8 - chunk.index.min(8)) * 2) as u64));
            Ok(vec![(chunk.index + 1) as f32; chunk.len() / 10 * 2])
        }
    }

    fn with_ctx<T>(token: &CancellationToken, f: impl FnOnce(&JobContext<'_>) -> T) -> T {
        let config = ConversionConfig::default();
        let sink = EventSink::new(64);
        let ctx = JobContext::new(1, &config, token, &sink);
        f(&ctx)
    }

    #[test]
    fn merges_in_index_order() {
        let plan = ChunkPlan::new(1_000, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let out = with_ctx(&token, |ctx| {
            run(&plan, &IndexProcessor::new(), ctx, 4, CrossfadeCurve::Linear)
        })
        .unwrap();
        assert_eq!(out.len(), 200);
        for (i, block) in out.chunks(40).enumerate() {
            assert!(block.iter().all(|&s| s == (i + 1) as f32), "block {i}");
        }
    }

    #[test]
    fn worker_count_does_not_change_output() {
        let plan = ChunkPlan::new(2_000, 300, 60, 10).unwrap();
        let token = CancellationToken::new();
        let one = with_ctx(&token, |ctx| {
            run(&plan, &IndexProcessor::new(), ctx, 1, CrossfadeCurve::EqualPower)
        })
        .unwrap();
        let many = with_ctx(&token, |ctx| {
            run(&plan, &IndexProcessor::new(), ctx, 6, CrossfadeCurve::EqualPower)
        })
        .unwrap();
        assert_eq!(one, many);
    }

    #[test]
    fn first_failure_is_reported_with_index() {
        let plan = ChunkPlan::new(1_000, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let processor = IndexProcessor {
            fail_at: Some(2),
            ..IndexProcessor::new()
        };
        let err = with_ctx(&token, |ctx| {
            run(&plan, &processor, ctx, 1, CrossfadeCurve::Linear)
        })
        .unwrap_err();
        assert_eq!(err.chunk_index(), Some(2));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3, "later chunks never start");
    }

    #[test]
    fn cancel_stops_remaining_chunks() {
        let plan = ChunkPlan::new(1_000, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let processor = IndexProcessor {
            cancel_after_first: Some(token.clone()),
            ..IndexProcessor::new()
        };
        let err = with_ctx(&token, |ctx| {
            run(&plan, &processor, ctx, 1, CrossfadeCurve::Linear)
        })
        .unwrap_err();
        assert!(matches!(err, VcError::Cancelled));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merging_starts_with_the_first_ordered_chunk() {
        let plan = ChunkPlan::new(1_000, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let config = ConversionConfig::default();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();
        let ctx = JobContext::new(1, &config, &token, &sink);
        run(&plan, &IndexProcessor::new(), &ctx, 1, CrossfadeCurve::Linear).unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        let merging = kinds
            .iter()
            .position(|k| {
                *k == JobEventKind::StateChanged {
                    state: JobState::Merging,
                }
            })
            .unwrap();
        let completed = |index| {
            kinds
                .iter()
                .position(|k| *k == JobEventKind::ChunkCompleted { index, total: 5 })
                .unwrap()
        };
        assert!(completed(0) < merging);
        assert!(merging < completed(1));
    }

    #[test]
    fn only_dispatched_chunks_are_started() {
        let plan = ChunkPlan::new(1_000, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let processor = IndexProcessor {
            cancel_after_first: Some(token.clone()),
            ..IndexProcessor::new()
        };
        let config = ConversionConfig::default();
        let sink = EventSink::new(64);
        let mut rx = sink.subscribe();
        let ctx = JobContext::new(1, &config, &token, &sink);
        run(&plan, &processor, &ctx, 1, CrossfadeCurve::Linear).unwrap_err();

        assert_eq!(ctx.diagnostics.snapshot().chunks_started, 1);
        let started: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e.kind {
                JobEventKind::ChunkStarted { index, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![0]);
    }

    #[test]
    fn empty_plan_yields_empty_output() {
        let plan = ChunkPlan::new(0, 200, 0, 10).unwrap();
        let token = CancellationToken::new();
        let out = with_ctx(&token, |ctx| {
            run(&plan, &IndexProcessor::new(), ctx, 4, CrossfadeCurve::Linear)
        })
        .unwrap();
        assert!(out.is_empty());
    }
}
