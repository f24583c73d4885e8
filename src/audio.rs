// Audio normalization for the Whisper server
//
// Every accepted upload is converted to the one form the engine consumes:
// 16 kHz, mono, 16-bit signed little-endian PCM in a RIFF WAV container.
// WAV inputs are read with hound, everything else is decoded with symphonia;
// multichannel audio is downmixed by averaging and resampled with a sinc
// interpolator. These functions are blocking and are run off the request
// path via spawn_blocking.

use std::fs::File;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::debug;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

/// Canonical sample rate fed to the engine
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Accepted input containers, matched on file-name extension
pub const SUPPORTED_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "ogg"];

/// Resampler input chunk, in frames
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("audio decoding failed: {0}")]
    Decode(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lower-cased extension of a file name, if any.
pub fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Whether a file name carries one of the accepted extensions.
pub fn is_supported(file_name: &str) -> bool {
    extension_of(file_name)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Decode `input`, downmix, resample and write the canonical WAV to `output`.
///
/// `original_name` selects the decoder by extension. On success the output
/// file exists and is the caller's to delete.
pub fn normalize_to_wav(
    input: &Path,
    original_name: &str,
    output: &Path,
) -> Result<(), AudioError> {
    let extension = extension_of(original_name)
        .ok_or_else(|| AudioError::UnsupportedFormat(original_name.to_string()))?;
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AudioError::UnsupportedFormat(extension));
    }

    let (samples, sample_rate, channels) = match extension.as_str() {
        "wav" => decode_wav(input)?,
        _ => decode_with_symphonia(input, &extension)?,
    };

    if samples.is_empty() {
        return Err(AudioError::Decode("no audio samples in input".to_string()));
    }

    let mono = downmix(&samples, channels);
    let resampled = if sample_rate == TARGET_SAMPLE_RATE {
        mono
    } else {
        resample(&mono, sample_rate, TARGET_SAMPLE_RATE)?
    };

    write_canonical_wav(output, &resampled)?;
    debug!(
        "normalized {} ({} Hz, {} ch) to {} samples at {} Hz",
        original_name,
        sample_rate,
        channels,
        resampled.len(),
        TARGET_SAMPLE_RATE
    );
    Ok(())
}

/// Read a canonical 16 kHz mono WAV back as f32 samples in [-1, 1].
pub fn read_canonical_wav(path: &Path) -> Result<Vec<f32>, AudioError> {
    let mut reader =
        WavReader::open(path).map_err(|e| AudioError::Decode(format!("failed to open WAV: {e}")))?;
    let spec = reader.spec();
    if spec.sample_rate != TARGET_SAMPLE_RATE || spec.channels != 1 || spec.bits_per_sample != 16 {
        return Err(AudioError::Decode(format!(
            "not canonical PCM: {} Hz, {} ch, {} bits",
            spec.sample_rate, spec.channels, spec.bits_per_sample
        )));
    }
    reader
        .samples::<i16>()
        .map(|s| s.map(|sample| sample as f32 / 32768.0))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AudioError::Decode(format!("failed to read samples: {e}")))
}

fn decode_wav(path: &Path) -> Result<(Vec<f32>, u32, usize), AudioError> {
    let mut reader =
        WavReader::open(path).map_err(|e| AudioError::Decode(format!("failed to open WAV: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AudioError::Decode(format!("failed to read samples: {e}")))?,
        (SampleFormat::Int, bits) if bits > 0 && bits <= 32 => {
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|sample| sample as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AudioError::Decode(format!("failed to read samples: {e}")))?
        }
        (format, bits) => {
            return Err(AudioError::Decode(format!(
                "unsupported WAV encoding: {:?} {} bits",
                format, bits
            )));
        }
    };

    Ok((samples, spec.sample_rate, spec.channels as usize))
}

fn decode_with_symphonia(path: &Path, extension: &str) -> Result<(Vec<f32>, u32, usize), AudioError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(format!("failed to probe format: {e}")))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("no audio track found".to_string()))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("could not determine sample rate".to_string()))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1);
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("failed to create decoder: {e}")))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(AudioError::Decode(format!("failed to read packet: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder
            .decode(&packet)
            .map_err(|e| AudioError::Decode(format!("failed to decode: {e}")))?;

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            let duration = decoded.capacity() as u64;
            sample_buf = Some(SampleBuffer::<f32>::new(duration, spec));
        }

        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    Ok((samples, sample_rate, channels))
}

/// Downmix interleaved samples to mono by averaging channels.
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Sinc resampling of a mono buffer.
fn resample(mono: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AudioError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        to_rate as f64 / from_rate as f64,
        2.0,
        params,
        RESAMPLE_CHUNK,
        1,
    )
    .map_err(|e| AudioError::Resample(format!("failed to create resampler: {e:?}")))?;

    let mut output = Vec::with_capacity(mono.len() * to_rate as usize / from_rate as usize + 1);
    let mut pos = 0;

    while pos + RESAMPLE_CHUNK <= mono.len() {
        let chunk = &mono[pos..pos + RESAMPLE_CHUNK];
        let resampled = resampler
            .process(&[chunk], None)
            .map_err(|e| AudioError::Resample(format!("{e:?}")))?;
        output.extend_from_slice(&resampled[0]);
        pos += RESAMPLE_CHUNK;
    }

    if pos < mono.len() {
        let tail = &mono[pos..];
        let resampled = resampler
            .process_partial(Some(&[tail]), None)
            .map_err(|e| AudioError::Resample(format!("{e:?}")))?;
        output.extend_from_slice(&resampled[0]);
    }

    // drain the interpolator's delay line so the end of the audio survives
    let drained = resampler
        .process_partial::<&[f32]>(None, None)
        .map_err(|e| AudioError::Resample(format!("{e:?}")))?;
    output.extend_from_slice(&drained[0]);

    Ok(output)
}

fn write_canonical_wav(path: &Path, samples: &[f32]) -> Result<(), AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| AudioError::Decode(format!("failed to create WAV writer: {e}")))?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer
            .write_sample(value)
            .map_err(|e| AudioError::Decode(format!("failed to write sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| AudioError::Decode(format!("failed to finalize WAV: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn sine(sample_rate: u32, seconds: f32) -> Vec<i16> {
        let count = (sample_rate as f32 * seconds) as usize;
        (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 12000.0) as i16
            })
            .collect()
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        assert!(is_supported("speech.WAV"));
        assert!(is_supported("speech.Mp3"));
        assert!(is_supported("a.b.flac"));
        assert!(!is_supported("speech.txt"));
        assert!(!is_supported("noextension"));
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = vec![0.5, 0.3, 0.1, -0.1, 0.2, 0.4];
        let mono = downmix(&stereo, 2);
        assert_eq!(mono, vec![0.4, 0.0, 0.3]);
    }

    #[test]
    fn downmix_mono_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(downmix(&samples, 1), samples);
    }

    #[test]
    fn normalize_produces_canonical_wav() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");
        let output = dir.path().join("output.wav");
        write_test_wav(&input, 8000, 1, &sine(8000, 0.5));

        normalize_to_wav(&input, "input.wav", &output).unwrap();

        let reader = WavReader::open(&output).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, TARGET_SAMPLE_RATE);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_format, SampleFormat::Int);

        // 0.5 s of audio upsampled 8 kHz -> 16 kHz, within resampler slack
        let frames = reader.len() as usize;
        assert!(
            frames > 7200 && frames < 8800,
            "unexpected frame count {}",
            frames
        );
    }

    #[test]
    fn normalize_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stereo.wav");
        let output = dir.path().join("mono.wav");

        // interleaved stereo at the target rate: no resampling, only downmix
        let left = sine(16000, 0.25);
        let interleaved: Vec<i16> = left.iter().flat_map(|&s| [s, s]).collect();
        write_test_wav(&input, 16000, 2, &interleaved);

        normalize_to_wav(&input, "stereo.wav", &output).unwrap();

        let reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len() as usize, left.len());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.txt");
        std::fs::write(&input, b"not audio").unwrap();
        let output = dir.path().join("output.wav");

        let err = normalize_to_wav(&input, "input.txt", &output).unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
        assert!(!output.exists());
    }

    #[test]
    fn garbage_bytes_fail_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("garbage.mp3");
        std::fs::write(&input, vec![0u8; 512]).unwrap();
        let output = dir.path().join("output.wav");

        assert!(normalize_to_wav(&input, "garbage.mp3", &output).is_err());
    }

    #[test]
    fn canonical_wav_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canonical.wav");
        let samples = vec![0.0f32, 0.25, -0.25, 0.5];
        write_canonical_wav(&path, &samples).unwrap();

        let read_back = read_canonical_wav(&path).unwrap();
        assert_eq!(read_back.len(), samples.len());
        for (a, b) in read_back.iter().zip(samples.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn non_canonical_wav_is_rejected_by_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrong-rate.wav");
        write_test_wav(&path, 44100, 1, &sine(44100, 0.1));
        assert!(read_canonical_wav(&path).is_err());
    }
}
