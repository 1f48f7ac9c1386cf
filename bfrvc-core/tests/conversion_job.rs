use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bfrvc_core::{
    audio, AudioBuffer, CancellationToken, ContentEncoder, ContentModel, ConversionConfig,
    ConversionEngine, ErrorKind, F0Method, FlatIndex, JobEventKind, JobState, ModelSet,
    OutputFormat, SpeakerEmbedding, VcError, Vocoder,
};
use bfrvc_core::engine::ChunkPlan;
use bfrvc_core::synthesis::SynthesisRequest;
use ndarray::Array2;
use parking_lot::Mutex;

const RATE: u32 = 16_000;
const HOP: usize = 160;

/// Per-frame mean magnitude and RMS, padded to four channels.
struct FrameStats;

impl ContentModel for FrameStats {
    fn hop_size(&self) -> usize {
        HOP
    }

    fn dim(&self) -> usize {
        4
    }

    fn encode(&self, samples: &[f32]) -> bfrvc_core::Result<Array2<f32>> {
        let frames = samples.len() / HOP;
        let mut out = Array2::zeros((frames, 4));
        for (i, frame) in samples.chunks_exact(HOP).enumerate() {
            let mean = frame.iter().map(|s| s.abs()).sum::<f32>() / HOP as f32;
            let rms = (frame.iter().map(|s| s * s).sum::<f32>() / HOP as f32).sqrt();
            out[[i, 0]] = mean;
            out[[i, 1]] = rms;
            out[[i, 2]] = mean * 0.5;
            out[[i, 3]] = rms * 0.5;
        }
        Ok(out)
    }
}

/// Holds the first feature channel for each frame; records what it saw.
#[derive(Default)]
struct HoldVocoder {
    calls: AtomicUsize,
    voiced_frames: AtomicUsize,
    fail_on_call: Option<usize>,
    cancel_on_first: Mutex<Option<CancellationToken>>,
}

impl Vocoder for HoldVocoder {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn hop_size(&self) -> usize {
        HOP
    }

    fn synthesize(&self, request: &SynthesisRequest<'_>) -> bfrvc_core::Result<Vec<f32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_first.lock().take() {
            token.cancel();
        }
        if self.fail_on_call == Some(call) {
            return Err(VcError::Model("vocoder exploded".into()));
        }
        let voiced = request.pitch.iter().filter(|&&f| f > 0.0).count();
        self.voiced_frames.fetch_add(voiced, Ordering::SeqCst);
        Ok(request
            .features
            .rows()
            .into_iter()
            .flat_map(|row| std::iter::repeat(row[0]).take(HOP))
            .collect())
    }
}

fn engine_with(vocoder: Arc<HoldVocoder>) -> ConversionEngine {
    let models = ModelSet::new(Arc::new(FrameStats), vocoder)
        .with_speaker(SpeakerEmbedding::id_only(0));
    ConversionEngine::new(Arc::new(models))
}

fn config(chunk_seconds: f32, workers: usize) -> ConversionConfig {
    ConversionConfig {
        f0_method: F0Method::Yin,
        chunk_length_seconds: chunk_seconds,
        crossfade_seconds: 0.5,
        workers,
        ..ConversionConfig::default()
    }
}

fn silence(seconds: f32) -> AudioBuffer {
    AudioBuffer::mono(vec![0.0; (seconds * RATE as f32) as usize], RATE)
}

/// Two alternating tones with a slow amplitude swell.
fn voice_like(seconds: f32) -> AudioBuffer {
    let n = (seconds * RATE as f32) as usize;
    let samples = (0..n)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            let f = if (t * 2.0) as usize % 2 == 0 { 150.0 } else { 220.0 };
            let env = 0.3 + 0.2 * (t * 1.3).sin();
            env * (std::f32::consts::TAU * f * t).sin()
        })
        .collect();
    AudioBuffer::mono(samples, RATE)
}

#[test]
fn ten_seconds_of_silence_in_three_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("silence.wav");
    let output = dir.path().join("out.wav");
    audio::write(&input, &silence(10.0), OutputFormat::Pcm16).unwrap();

    let vocoder = Arc::new(HoldVocoder::default());
    let engine = engine_with(Arc::clone(&vocoder));
    let report = engine
        .convert_file(&input, &output, &config(4.0, 2), &CancellationToken::new())
        .unwrap();

    assert_eq!(report.chunks, 3);
    assert_eq!(vocoder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(vocoder.voiced_frames.load(Ordering::SeqCst), 0);
    assert!((report.output_duration().as_secs_f64() - 10.0).abs() <= 0.05);

    let written = audio::load(&output).unwrap();
    assert_eq!(written.sample_rate, RATE);
    assert!((written.duration_secs() - 10.0).abs() <= 0.05);
}

#[test]
fn chunking_preserves_length() {
    let source = voice_like(10.0);
    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let token = CancellationToken::new();

    let chunked = engine
        .convert_buffer(source.clone(), &config(4.0, 2), &token)
        .unwrap();
    let whole = engine
        .convert_buffer(source, &config(60.0, 2), &token)
        .unwrap();
    assert_eq!(chunked.samples.len(), whole.samples.len());
    assert_eq!(whole.samples.len(), 1_000 * HOP);
}

#[test]
fn worker_count_does_not_change_output() {
    let source = voice_like(7.0);
    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let token = CancellationToken::new();

    let serial = engine
        .convert_buffer(source.clone(), &config(2.0, 1), &token)
        .unwrap();
    let parallel = engine
        .convert_buffer(source, &config(2.0, 4), &token)
        .unwrap();
    assert_eq!(serial.samples, parallel.samples);
}

#[test]
fn cancel_after_first_of_five_chunks_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    audio::write(&input, &voice_like(10.0), OutputFormat::Pcm16).unwrap();

    let job = config(2.4, 1);
    let plan = ChunkPlan::new(10 * RATE as usize, 38_400, 8_000, HOP).unwrap();
    assert_eq!(plan.len(), 5);

    let token = CancellationToken::new();
    let vocoder = Arc::new(HoldVocoder {
        cancel_on_first: Mutex::new(Some(token.clone())),
        ..HoldVocoder::default()
    });
    let engine = engine_with(Arc::clone(&vocoder));
    let mut rx = engine.subscribe_events();

    let err = engine
        .convert_file(&input, &output, &job, &token)
        .unwrap_err();
    assert!(matches!(err, VcError::Cancelled));
    assert_eq!(vocoder.calls.load(Ordering::SeqCst), 1);
    assert!(!output.exists());

    let mut started = Vec::new();
    let mut last_state = None;
    while let Ok(event) = rx.try_recv() {
        match event.kind {
            JobEventKind::ChunkStarted { index, total } => {
                assert_eq!(total, 5);
                started.push(index);
            }
            JobEventKind::StateChanged { state } => last_state = Some(state),
            _ => {}
        }
    }
    assert_eq!(started, vec![0], "chunks 1..5 never start");
    assert_eq!(last_state, Some(JobState::Cancelled));
}

#[test]
fn malformed_wav_is_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.wav");
    let output = dir.path().join("out.wav");
    std::fs::write(&input, b"RIFF\x24\x00\x00\x00JUNKJUNKJUNKJUNK").unwrap();

    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let err = engine
        .convert_file(&input, &output, &config(4.0, 1), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(!output.exists());
}

#[test]
fn truncated_wav_is_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("short.wav");
    let output = dir.path().join("out.wav");
    audio::write(&input, &voice_like(1.0), OutputFormat::Pcm16).unwrap();
    let bytes = std::fs::read(&input).unwrap();
    std::fs::write(&input, &bytes[..30]).unwrap();

    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let err = engine
        .convert_file(&input, &output, &config(4.0, 1), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(!output.exists());
}

#[test]
fn garbage_mp3_is_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.mp3");
    let output = dir.path().join("out.wav");
    std::fs::write(&input, vec![0x5A_u8; 4096]).unwrap();

    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let err = engine
        .convert_file(&input, &output, &config(4.0, 1), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(!output.exists());
}

#[test]
fn oversized_chunk_length_is_invalid_config() {
    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let err = engine
        .convert_buffer(voice_like(1.0), &config(1e16, 1), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}

#[test]
fn missing_input_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(Arc::new(HoldVocoder::default()));
    let err = engine
        .convert_file(
            dir.path().join("absent.wav"),
            dir.path().join("out.wav"),
            &config(4.0, 1),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn chunk_failure_reports_its_index() {
    let vocoder = Arc::new(HoldVocoder {
        fail_on_call: Some(2),
        ..HoldVocoder::default()
    });
    let engine = engine_with(Arc::clone(&vocoder));
    let mut rx = engine.subscribe_events();

    let err = engine
        .convert_buffer(voice_like(10.0), &config(2.0, 1), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.chunk_index(), Some(2));
    assert_eq!(err.kind(), ErrorKind::Model);
    assert_eq!(vocoder.calls.load(Ordering::SeqCst), 3);

    let failed = std::iter::from_fn(|| rx.try_recv().ok())
        .find_map(|event| match event.kind {
            JobEventKind::Failed { kind, .. } => Some(kind),
            _ => None,
        });
    assert_eq!(failed, Some(ErrorKind::Model));
}

#[test]
fn zero_retrieval_ratio_matches_no_index() {
    let reference = AudioBuffer::mono(vec![0.1; RATE as usize], RATE);
    let reference = ContentEncoder::new(Arc::new(FrameStats))
        .encode(&reference)
        .unwrap();
    let index = FlatIndex::from_sequences(std::iter::once(&reference))
        .unwrap()
        .into_shared();

    let vocoder: Arc<HoldVocoder> = Arc::new(HoldVocoder::default());
    let plain = ModelSet::new(Arc::new(FrameStats), vocoder.clone())
        .with_speaker(SpeakerEmbedding::id_only(0));
    let indexed = plain.clone().with_index(index);
    let plain = ConversionEngine::new(Arc::new(plain));
    let indexed = ConversionEngine::new(Arc::new(indexed));

    let source = voice_like(3.0);
    let token = CancellationToken::new();
    let off = ConversionConfig {
        retrieval_ratio: 0.0,
        ..config(4.0, 2)
    };
    let a = plain.convert_buffer(source.clone(), &off, &token).unwrap();
    let b = indexed.convert_buffer(source.clone(), &off, &token).unwrap();
    assert_eq!(a.samples, b.samples);

    let full = ConversionConfig {
        retrieval_ratio: 1.0,
        protect: 0.5,
        ..config(4.0, 2)
    };
    let c = indexed.convert_buffer(source, &full, &token).unwrap();
    assert_ne!(a.samples, c.samples);
}
