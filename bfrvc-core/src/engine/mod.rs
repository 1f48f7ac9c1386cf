//! `ConversionEngine` — top-level job controller.
//!
//! ## Job flow
//!
//! ```text
//! convert_file(input, output, config, token)
//!     ├─► load + condition   (mono, 16 kHz, high-pass, peak normalise)
//!     ├─► Chunking           ChunkPlan over the conditioned input
//!     ├─► Inference          orchestrator::run (scoped workers)
//!     ├─► Merging            ordered crossfade, output resample, peak limit
//!     └─► Done               atomic WAV write
//! ```
//!
//! The engine is `Send + Sync` and holds no per-job state: everything a job
//! needs travels in its `JobContext`. Device gates and the event channel are
//! shared by all jobs of one engine.

pub mod chunking;
pub mod job;
pub mod orchestrator;
pub mod pipeline;

pub use chunking::{Chunk, ChunkPlan, CrossfadeCurve, OutputBuffer};
pub use job::{CancellationToken, DiagnosticsSnapshot, JobContext, JobDiagnostics, JobReport};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::{
    audio::{self, filter::highpass, AudioBuffer, INPUT_PEAK_LIMIT, OUTPUT_PEAK_LIMIT},
    config::ConversionConfig,
    content::{ContentEncoder, ContentModel, SpectralContentModel},
    device::{Device, DeviceContext},
    error::{Result, VcError},
    events::{JobEvent, JobEventKind, JobState},
    pitch::{PitchEstimator, PitchExtractor},
    retrieval::NeighborSearch,
    synthesis::{HarmonicVocoder, SpeakerBank, SpeakerEmbedding, SynthesisEngine, Vocoder},
    FRAME_HOP, MODEL_SAMPLE_RATE,
};

use job::EventSink;
use pipeline::ConversionPipeline;

/// Broadcast channel capacity: events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// The pre-loaded collaborators a job runs with. Shared read-only.
#[derive(Clone, Default)]
pub struct ModelSet {
    pub content: ContentEncoder,
    pub synthesis: SynthesisEngine,
    /// Backs `F0Method::Rmvpe`.
    pub pitch_model: Option<Arc<dyn PitchEstimator>>,
    pub index: Option<Arc<dyn NeighborSearch>>,
    pub speakers: SpeakerBank,
}

impl ModelSet {
    pub fn new(content: Arc<dyn ContentModel>, vocoder: Arc<dyn Vocoder>) -> Self {
        Self {
            content: ContentEncoder::new(content),
            synthesis: SynthesisEngine::new(vocoder),
            ..Self::default()
        }
    }

    /// Weight-free models: log-mel content frames and the harmonic vocoder,
    /// with speaker 0 at flat gain.
    pub fn builtin() -> Self {
        Self::new(
            Arc::new(SpectralContentModel::default()),
            Arc::new(HarmonicVocoder::default()),
        )
        .with_speaker(SpeakerEmbedding::id_only(0))
    }

    pub fn with_pitch_model(mut self, model: Arc<dyn PitchEstimator>) -> Self {
        self.pitch_model = Some(model);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn NeighborSearch>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_speakers(mut self, speakers: SpeakerBank) -> Self {
        self.speakers = speakers;
        self
    }

    pub fn with_speaker(mut self, speaker: SpeakerEmbedding) -> Self {
        self.speakers.insert(speaker);
        self
    }

    /// Every loaded model must live on `device`.
    fn check_device(&self, device: Device, config: &ConversionConfig) -> Result<()> {
        let mut placed = vec![
            ("content encoder", self.content.device()),
            ("vocoder", self.synthesis.device()),
        ];
        if config.f0_method.is_neural() {
            placed.push(("pitch model", self.pitch_model.as_ref().map(|m| m.device())));
        }
        for (name, actual) in placed {
            if let Some(actual) = actual {
                if actual != device {
                    return Err(VcError::Model(format!(
                        "{name} is loaded on {actual}, job requested {device}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSet")
            .field("content", &self.content)
            .field("synthesis", &self.synthesis)
            .field("pitch_model", &self.pitch_model.as_ref().map(|m| m.method()))
            .field("index", &self.index.as_ref().map(|i| i.dim()))
            .field("speakers", &self.speakers.len())
            .finish()
    }
}

/// The top-level engine handle.
///
/// Wrap in `Arc<ConversionEngine>` to run jobs from several threads or
/// async tasks.
pub struct ConversionEngine {
    models: Arc<ModelSet>,
    devices: Mutex<HashMap<Device, Arc<DeviceContext>>>,
    events: Arc<EventSink>,
    next_job: AtomicU64,
}

impl ConversionEngine {
    pub fn new(models: Arc<ModelSet>) -> Self {
        Self {
            models,
            devices: Mutex::new(HashMap::new()),
            events: Arc::new(EventSink::new(BROADCAST_CAP)),
            next_job: AtomicU64::new(1),
        }
    }

    pub fn models(&self) -> &Arc<ModelSet> {
        &self.models
    }

    /// Subscribe to progress events of every job run on this engine.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Convert the audio file at `input` and write the result to `output`.
    ///
    /// `output` is only created (or replaced) when the whole job succeeds.
    ///
    /// # Errors
    /// - `VcError::Io` / `VcError::Decode` for unreadable input or an
    ///   unwritable destination.
    /// - `VcError::Chunk` if any chunk fails; `VcError::Cancelled` if
    ///   `token` fires first.
    /// - `VcError::Model` / `VcError::InvalidConfig` for jobs that cannot run.
    pub fn convert_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        config: &ConversionConfig,
        token: &CancellationToken,
    ) -> Result<JobReport> {
        let (input, output) = (input.as_ref(), output.as_ref());
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("job", job_id, input = %input.display());
        let _guard = span.enter();
        let ctx = JobContext::new(job_id, config, token, &self.events);
        let started = Instant::now();

        let result = audio::load(input).and_then(|source| {
            info!(
                sample_rate = source.sample_rate,
                channels = source.channels,
                seconds = source.duration_secs(),
                "input loaded"
            );
            let (converted, chunks) = self.run_job(&ctx, &source)?;
            token.check()?;
            audio::write(output, &converted, config.output_format)?;
            info!(output = %output.display(), "output written");
            Ok(self.report(&ctx, &source, &converted, chunks, started))
        });
        self.finish(&ctx, result, |r| (r.output_samples, r.output_sample_rate))
    }

    /// Convert an in-memory buffer. Same pipeline as [`convert_file`](Self::convert_file)
    /// without the file IO.
    pub fn convert_buffer(
        &self,
        source: AudioBuffer,
        config: &ConversionConfig,
        token: &CancellationToken,
    ) -> Result<AudioBuffer> {
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("job", job_id);
        let _guard = span.enter();
        let ctx = JobContext::new(job_id, config, token, &self.events);
        let started = Instant::now();

        let result = self.run_job(&ctx, &source).and_then(|(converted, chunks)| {
            token.check()?;
            let report = self.report(&ctx, &source, &converted, chunks, started);
            debug!(elapsed_ms = report.elapsed_ms, "buffer converted");
            Ok(converted)
        });
        self.finish(&ctx, result, |b| (b.frames(), b.sample_rate))
    }

    /// [`convert_file`](Self::convert_file) on the blocking thread pool.
    pub async fn convert_file_async(
        self: Arc<Self>,
        input: PathBuf,
        output: PathBuf,
        config: ConversionConfig,
        token: CancellationToken,
    ) -> Result<JobReport> {
        tokio::task::spawn_blocking(move || self.convert_file(&input, &output, &config, &token))
            .await
            .map_err(|e| VcError::Other(anyhow::anyhow!("conversion task failed: {e}")))?
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Condition, chunk, infer and post-process. Returns the output buffer and
    /// the number of chunks.
    fn run_job(
        &self,
        ctx: &JobContext<'_>,
        source: &AudioBuffer,
    ) -> Result<(AudioBuffer, usize)> {
        let config = ctx.config;
        config.validate()?;
        ctx.token.check()?;

        let models = &self.models;
        let vocoder_rate = models
            .synthesis
            .sample_rate()
            .ok_or_else(|| VcError::Model("vocoder model is not loaded".into()))?;
        let output_hop = models.synthesis.hop_size().unwrap_or(0);
        if !models.content.is_loaded() {
            return Err(VcError::Model("content encoder model is not loaded".into()));
        }
        models.check_device(config.device, config)?;
        let speaker = models.speakers.get(config.speaker_id)?;
        let device = self.device_context(config);

        ctx.set_state(JobState::Chunking);
        let input = condition(source, config)?;
        let window = seconds_to_samples(config.chunk_length_seconds);
        let overlap = seconds_to_samples(config.crossfade_seconds);
        let plan = ChunkPlan::new(input.len(), window, overlap, FRAME_HOP)?;
        debug!(
            samples = input.len(),
            chunks = plan.len(),
            window = plan.window(),
            overlap = plan.overlap(),
            "chunk plan"
        );

        let pipeline = ConversionPipeline {
            input: &input,
            content: &models.content,
            pitch: PitchExtractor::new(models.pitch_model.clone())
                .with_filter_radius(config.filter_radius),
            index: models.index.as_deref(),
            synthesis: &models.synthesis,
            speaker,
            device: &device,
            output_hop,
        };
        let merged = orchestrator::run(
            &plan,
            &pipeline,
            ctx,
            config.workers,
            config.crossfade_curve,
        )?;

        let mut converted = AudioBuffer::mono(merged, vocoder_rate);
        if let Some(rate) = config.output_sample_rate {
            if rate != converted.sample_rate {
                converted = audio::resample(&converted, rate)?;
            }
        }
        audio::limit_peak(&mut converted.samples, OUTPUT_PEAK_LIMIT);
        Ok((converted, plan.len()))
    }

    fn device_context(&self, config: &ConversionConfig) -> Arc<DeviceContext> {
        let mut devices = self.devices.lock();
        let ctx = devices.entry(config.device).or_insert_with(|| {
            let streams = match config.device {
                Device::Cpu => config.workers.max(
                    std::thread::available_parallelism()
                        .map(|n| n.get())
                        .unwrap_or(1),
                ),
                Device::Accelerator => config.accelerator_streams,
            };
            info!(device = %config.device, streams, "device context created");
            Arc::new(DeviceContext::new(config.device, streams))
        });
        if config.device == Device::Accelerator && ctx.streams() != config.accelerator_streams.max(1)
        {
            warn!(
                requested = config.accelerator_streams,
                active = ctx.streams(),
                "accelerator stream count is fixed per engine"
            );
        }
        Arc::clone(ctx)
    }

    fn report(
        &self,
        ctx: &JobContext<'_>,
        source: &AudioBuffer,
        converted: &AudioBuffer,
        chunks: usize,
        started: Instant,
    ) -> JobReport {
        JobReport {
            job_id: ctx.job_id,
            chunks,
            input_samples: source.frames(),
            input_sample_rate: source.sample_rate,
            output_samples: converted.frames(),
            output_sample_rate: converted.sample_rate,
            elapsed_ms: started.elapsed().as_millis() as u64,
            diagnostics: ctx.diagnostics.snapshot(),
        }
    }

    /// Publish the terminal state for `result`; `summary` yields the output
    /// length and rate of a success.
    fn finish<T>(
        &self,
        ctx: &JobContext<'_>,
        result: Result<T>,
        summary: impl FnOnce(&T) -> (usize, u32),
    ) -> Result<T> {
        match &result {
            Ok(value) => {
                let snapshot = ctx.diagnostics.snapshot();
                let (output_samples, sample_rate) = summary(value);
                ctx.set_state(JobState::Done);
                ctx.emit(JobEventKind::Finished {
                    output_samples,
                    sample_rate,
                });
                info!(
                    chunks = snapshot.chunks_completed,
                    frames = snapshot.frames_encoded,
                    "job finished"
                );
            }
            Err(err) => ctx.fail(err),
        }
        result
    }
}

impl fmt::Debug for ConversionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionEngine")
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

/// Mono, 16 kHz, high-passed, peak-normalised copy of `source`.
fn condition(source: &AudioBuffer, config: &ConversionConfig) -> Result<Vec<f32>> {
    let mono = source.to_mono();
    let mut input = if mono.sample_rate == MODEL_SAMPLE_RATE {
        mono
    } else {
        audio::resample(&mono, MODEL_SAMPLE_RATE)?
    };
    if let Some(cutoff) = config.highpass_hz {
        highpass(&mut input.samples, cutoff, MODEL_SAMPLE_RATE);
    }
    input.normalize_peak(INPUT_PEAK_LIMIT);
    Ok(input.samples)
}

fn seconds_to_samples(seconds: f32) -> usize {
    (seconds.max(0.0) as f64 * MODEL_SAMPLE_RATE as f64).round() as usize
}
