//! `bfrvc-convert` — run one conversion job from the command line.
//!
//! ```text
//! bfrvc-convert --input in.wav --output out.wav [--config job.json]
//!     [--f0 yin|acf|rmvpe] [--pitch <semitones>] [--device cpu|accelerator]
//!     [--workers <n>] [--speaker <id>] [--index-audio <reference.wav>]
//!     [--events]
//! ```
//!
//! With the `onnx` feature, `--hubert`, `--rmvpe` and `--synth` (plus
//! `--synth-rate`) swap the built-in backends for ONNX models. Log verbosity
//! follows `RUST_LOG` (default `bfrvc_core=info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bfrvc_core::{
    audio, CancellationToken, ContentEncoder, ConversionConfig, ConversionEngine, Device,
    FlatIndex, ModelSet, VcError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    f0: Option<String>,
    pitch: Option<i32>,
    device: Option<String>,
    workers: Option<usize>,
    speaker: Option<u32>,
    index_audio: Option<PathBuf>,
    events: bool,
    hubert: Option<PathBuf>,
    rmvpe: Option<PathBuf>,
    synth: Option<PathBuf>,
    synth_rate: Option<u32>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bfrvc_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("conversion failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let input = args.input.clone().ok_or("missing --input")?;
    let output = args.output.clone().ok_or("missing --output")?;

    let mut config = match &args.config {
        Some(path) => ConversionConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => ConversionConfig::default(),
    };
    if let Some(f0) = &args.f0 {
        config.f0_method = f0.parse().map_err(|e: VcError| e.to_string())?;
    }
    if let Some(pitch) = args.pitch {
        config.pitch_shift_semitones = pitch;
    }
    if let Some(device) = &args.device {
        config.device = device.parse::<Device>().map_err(|e| e.to_string())?;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(speaker) = args.speaker {
        config.speaker_id = speaker;
    }

    let mut models = load_models(&args, &config)?;
    if let Some(reference) = &args.index_audio {
        let index = build_index(&models.content, reference)?;
        info!(vectors = index.len(), reference = %reference.display(), "retrieval index built");
        models = models.with_index(index.into_shared());
    }

    let engine = ConversionEngine::new(Arc::new(models));
    if args.events {
        let mut rx = engine.subscribe_events();
        std::thread::spawn(move || {
            while let Ok(event) = rx.blocking_recv() {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        });
    }

    let token = CancellationToken::new();
    let report = engine
        .convert_file(&input, &output, &config, &token)
        .map_err(|e| e.to_string())?;
    info!(
        chunks = report.chunks,
        seconds = report.output_duration().as_secs_f64(),
        elapsed_ms = report.elapsed_ms,
        output = %output.display(),
        "conversion finished"
    );
    Ok(())
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().ok_or_else(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--input" | "-i" => args.input = Some(PathBuf::from(value("--input")?)),
            "--output" | "-o" => args.output = Some(PathBuf::from(value("--output")?)),
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--f0" => args.f0 = Some(value("--f0")?),
            "--pitch" => {
                args.pitch = Some(
                    value("--pitch")?
                        .parse()
                        .map_err(|_| "invalid value for --pitch".to_string())?,
                )
            }
            "--device" => args.device = Some(value("--device")?),
            "--workers" => {
                args.workers = Some(
                    value("--workers")?
                        .parse()
                        .map_err(|_| "invalid value for --workers".to_string())?,
                )
            }
            "--speaker" => {
                args.speaker = Some(
                    value("--speaker")?
                        .parse()
                        .map_err(|_| "invalid value for --speaker".to_string())?,
                )
            }
            "--index-audio" => args.index_audio = Some(PathBuf::from(value("--index-audio")?)),
            "--events" => args.events = true,
            "--hubert" => args.hubert = Some(PathBuf::from(value("--hubert")?)),
            "--rmvpe" => args.rmvpe = Some(PathBuf::from(value("--rmvpe")?)),
            "--synth" => args.synth = Some(PathBuf::from(value("--synth")?)),
            "--synth-rate" => {
                args.synth_rate = Some(
                    value("--synth-rate")?
                        .parse()
                        .map_err(|_| "invalid value for --synth-rate".to_string())?,
                )
            }
            "--help" | "-h" => {
                println!(
                    "Usage: bfrvc-convert --input <file> --output <file.wav> [--config <job.json>] \\
  [--f0 yin|acf|rmvpe] [--pitch <semitones>] [--device cpu|accelerator] [--workers <n>] \\
  [--speaker <id>] [--index-audio <file>] [--events] \\
  [--hubert <model.onnx>] [--rmvpe <model.onnx>] [--synth <model.onnx> --synth-rate <hz>]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

/// Encode a reference recording into a flat retrieval index.
fn build_index(content: &ContentEncoder, reference: &Path) -> Result<FlatIndex, String> {
    let buffer = audio::load(reference).map_err(|e| e.to_string())?.to_mono();
    let sequence = content.encode(&buffer).map_err(|e| e.to_string())?;
    FlatIndex::from_sequences(std::iter::once(&sequence)).map_err(|e| e.to_string())
}

#[cfg(not(feature = "onnx"))]
fn load_models(args: &Args, _config: &ConversionConfig) -> Result<ModelSet, String> {
    if args.hubert.is_some() || args.rmvpe.is_some() || args.synth.is_some() {
        return Err("ONNX model flags require the 'onnx' feature".into());
    }
    Ok(ModelSet::builtin())
}

#[cfg(feature = "onnx")]
fn load_models(args: &Args, config: &ConversionConfig) -> Result<ModelSet, String> {
    use bfrvc_core::{
        OnnxContentConfig, OnnxContentModel, OnnxPitchModel, OnnxVocoder, OnnxVocoderConfig,
        SpeakerEmbedding, SynthesisEngine,
    };

    let device = config.device;
    let mut models = ModelSet::builtin();
    if let Some(path) = &args.hubert {
        let mut content = OnnxContentConfig::new(path);
        content.device = device;
        let model = OnnxContentModel::load(content).map_err(|e| e.to_string())?;
        models.content = ContentEncoder::new(Arc::new(model));
    }
    if let Some(path) = &args.rmvpe {
        let model = OnnxPitchModel::load(path, device).map_err(|e| e.to_string())?;
        models = models.with_pitch_model(Arc::new(model));
    }
    if let Some(path) = &args.synth {
        let rate = args.synth_rate.unwrap_or(40_000);
        let mut vocoder = OnnxVocoderConfig::new(path, rate);
        vocoder.device = device;
        let model = OnnxVocoder::load(vocoder).map_err(|e| e.to_string())?;
        // Multi-speaker exports take the id directly; no embedding vector.
        models = models.with_speaker(SpeakerEmbedding::id_only(config.speaker_id));
        models.synthesis = SynthesisEngine::new(Arc::new(model));
    }
    Ok(models)
}
