//! Loading and writing audio files.
//!
//! WAV goes through `hound`; every other container (FLAC, OGG/Vorbis, MP3,
//! …) is probed and decoded by `symphonia`. Writing always produces WAV and
//! is atomic: samples land in a temporary file next to the destination which
//! is renamed over it only once fully written, so a failure never leaves a
//! truncated output behind.

use std::fs;
use std::io::{BufWriter, Cursor};
use std::path::Path;

use serde::{Deserialize, Serialize};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, info, warn};

use crate::audio::AudioBuffer;
use crate::error::{Result, VcError};

/// Extensions of the containers the bundled symphonia readers handle. A file
/// carrying one of these that fails to probe is corrupt, not unsupported.
const KNOWN_CONTAINERS: &[&str] = &["flac", "ogg", "oga", "mp3", "mka", "mkv", "webm"];

/// Sample encoding used when writing WAV output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 16-bit signed integer PCM.
    #[default]
    Pcm16,
    /// 32-bit IEEE float.
    Float32,
}

/// Read and decode an audio file.
///
/// # Errors
/// - `VcError::Io` if the file cannot be read or its container is unknown.
/// - `VcError::Decode` if the data is malformed, including garbage behind a
///   known container extension.
pub fn load(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|e| e.to_str());
    let buffer = decode(&bytes, ext)?;
    info!(
        path = ?path,
        sample_rate = buffer.sample_rate,
        channels = buffer.channels,
        seconds = format_args!("{:.2}", buffer.duration_secs()),
        "loaded audio"
    );
    Ok(buffer)
}

/// Decode an in-memory audio file. `extension_hint` (e.g. `"flac"`) helps the
/// container probe; WAV is also recognised by its RIFF header.
pub fn decode(bytes: &[u8], extension_hint: Option<&str>) -> Result<AudioBuffer> {
    let by_ext = extension_hint
        .map(|e| e.eq_ignore_ascii_case("wav") || e.eq_ignore_ascii_case("wave"))
        .unwrap_or(false);
    let by_magic = bytes.starts_with(b"RIFF") || bytes.starts_with(b"RF64");
    if by_ext || by_magic {
        decode_wav(bytes)
    } else {
        decode_container(bytes, extension_hint)
    }
}

fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(map_hound_read_error)?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(VcError::Decode(format!(
            "invalid WAV header: {} channels @ {} Hz",
            spec.channels, spec.sample_rate
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_hound_read_error)?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_hound_read_error)?
        }
    };

    Ok(AudioBuffer::new(samples, spec.sample_rate, spec.channels))
}

fn decode_container(bytes: &[u8], extension_hint: Option<&str>) -> Result<AudioBuffer> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension_hint {
        hint.with_extension(ext);
    }

    let known = extension_hint
        .map(|ext| KNOWN_CONTAINERS.iter().any(|k| k.eq_ignore_ascii_case(ext)))
        .unwrap_or(false);
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            SymphoniaError::Unsupported(what) if known => {
                VcError::Decode(format!("malformed audio container: {what}"))
            }
            other => map_symphonia_error(other),
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VcError::Decode("no audio track found".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(map_symphonia_error)?;

    let mut sample_rate = params.sample_rate.unwrap_or(0);
    let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);
    let mut samples = Vec::new();
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(map_symphonia_error(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                skipped_packets += 1;
                warn!("skipping corrupt packet: {e}");
                continue;
            }
            Err(e) => return Err(map_symphonia_error(e)),
        };
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }

    if samples.is_empty() && skipped_packets > 0 {
        return Err(VcError::Decode(format!(
            "all {skipped_packets} packets failed to decode"
        )));
    }
    if sample_rate == 0 || channels == 0 {
        return Err(VcError::Decode("stream has no sample rate or channels".into()));
    }
    debug!(sample_rate, channels, skipped_packets, "decoded container");

    Ok(AudioBuffer::new(samples, sample_rate, channels))
}

// Both decoders read from memory, so their IO errors describe the data.
fn map_hound_read_error(e: hound::Error) -> VcError {
    match e {
        hound::Error::IoError(io) => VcError::Decode(format!("truncated WAV data: {io}")),
        hound::Error::Unsupported => VcError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unsupported WAV encoding",
        )),
        other => VcError::Decode(other.to_string()),
    }
}

fn map_symphonia_error(e: SymphoniaError) -> VcError {
    match e {
        SymphoniaError::IoError(io) => VcError::Decode(format!("truncated stream: {io}")),
        SymphoniaError::Unsupported(what) => VcError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("unsupported audio format: {what}"),
        )),
        other => VcError::Decode(other.to_string()),
    }
}

/// Write `buffer` as a WAV file at `path`, replacing any existing file.
///
/// # Errors
/// Returns `VcError::Io` when the destination directory is missing or not
/// writable. On error nothing is left at `path`.
pub fn write(path: impl AsRef<Path>, buffer: &AudioBuffer, format: OutputFormat) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".bfrvc-")
        .suffix(".wav.part")
        .tempfile_in(dir)?;

    let spec = hound::WavSpec {
        channels: buffer.channels.max(1),
        sample_rate: buffer.sample_rate,
        bits_per_sample: match format {
            OutputFormat::Pcm16 => 16,
            OutputFormat::Float32 => 32,
        },
        sample_format: match format {
            OutputFormat::Pcm16 => hound::SampleFormat::Int,
            OutputFormat::Float32 => hound::SampleFormat::Float,
        },
    };

    {
        let sink = BufWriter::new(tmp.as_file_mut());
        let mut writer = hound::WavWriter::new(sink, spec).map_err(map_hound_write_error)?;
        match format {
            OutputFormat::Pcm16 => {
                for &s in &buffer.samples {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                    writer.write_sample(v).map_err(map_hound_write_error)?;
                }
            }
            OutputFormat::Float32 => {
                for &s in &buffer.samples {
                    writer.write_sample(s).map_err(map_hound_write_error)?;
                }
            }
        }
        writer.finalize().map_err(map_hound_write_error)?;
    }

    tmp.persist(path).map_err(|e| VcError::Io(e.error))?;
    info!(
        path = ?path,
        sample_rate = buffer.sample_rate,
        seconds = format_args!("{:.2}", buffer.duration_secs()),
        "wrote audio"
    );
    Ok(())
}

fn map_hound_write_error(e: hound::Error) -> VcError {
    match e {
        hound::Error::IoError(io) => VcError::Io(io),
        other => VcError::Other(anyhow::anyhow!("WAV encode: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_round_trip_float32() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let buf = AudioBuffer::new(vec![0.0, 0.25, -0.5, 0.75], 22_050, 2);

        write(&path, &buf, OutputFormat::Float32).unwrap();
        let back = load(&path).unwrap();

        assert_eq!(back, buf);
    }

    #[test]
    fn pcm16_quantises_within_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let buf = AudioBuffer::mono(vec![0.1, -0.3, 0.9], 16_000);

        write(&path, &buf, OutputFormat::Pcm16).unwrap();
        let back = load(&path).unwrap();

        assert_eq!(back.sample_rate, 16_000);
        for (a, b) in back.samples.iter().zip(&buf.samples) {
            assert!((a - b).abs() < 1.0 / 16_000.0, "{a} vs {b}");
        }
    }

    #[test]
    fn write_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        fs::write(&path, b"stale").unwrap();

        write(&path, &AudioBuffer::mono(vec![0.5; 8], 8_000), OutputFormat::Pcm16).unwrap();

        assert_eq!(load(&path).unwrap().frames(), 8);
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        write(&path, &AudioBuffer::mono(vec![0.0; 8], 8_000), OutputFormat::Pcm16).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.wav")]);
    }

    #[test]
    fn corrupt_wav_is_decode_error() {
        let err = decode(b"RIFF\x10\x00\x00\x00WAVEjunkjunkjunk", Some("wav")).unwrap_err();
        assert!(matches!(err, VcError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn truncated_riff_is_decode_error() {
        let err = decode(b"RIFF\x24\x00\x00\x00WAVEfmt ", Some("wav")).unwrap_err();
        assert!(matches!(err, VcError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn garbage_mp3_is_decode_error() {
        let err = decode(&[0x5A; 4096], Some("mp3")).unwrap_err();
        assert!(matches!(err, VcError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn truncated_flac_header_is_decode_error() {
        let err = decode(b"fLaC\x00\x00", Some("flac")).unwrap_err();
        assert!(matches!(err, VcError::Decode(_)), "got {err:?}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load("/definitely/not/here.wav").unwrap_err();
        assert!(matches!(err, VcError::Io(_)));
    }

    #[test]
    fn unknown_container_is_io_error() {
        let err = decode(&[0x13, 0x37, 0x00, 0x42, 0x99, 0x01, 0x02, 0x03], Some("xyz"))
            .unwrap_err();
        assert!(matches!(err, VcError::Io(_)), "got {err:?}");
    }

    #[test]
    fn unwritable_destination_is_io_error() {
        let err = write(
            "/definitely/not/here/out.wav",
            &AudioBuffer::mono(vec![0.0; 4], 8_000),
            OutputFormat::Pcm16,
        )
        .unwrap_err();
        assert!(matches!(err, VcError::Io(_)));
    }
}
